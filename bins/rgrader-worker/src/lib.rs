pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod friendly;
pub mod libraries;
pub mod runner;
pub mod synthesizer;

pub use evaluator::Grader;
pub use executor::Sandbox;
