/// Sandbox Facade - The Only Entry Point for Running Student Code
///
/// **Responsibility:**
/// Accept (student code, test code, libraries) and always hand back exactly one
/// `ExecutionResult`. Nothing escapes this boundary: strategy failures, I/O
/// errors and even panics inside a strategy become `status=error` results.
///
/// **Strategy Selection:**
/// 1. Optional primary strategy (injected by the host, e.g. an embedded interpreter)
/// 2. Subprocess strategy (always present)
///
/// The primary is abandoned for this call when it reports `Unavailable` or
/// `Failed`, or panics. A `Completed` result is final, even if it is an error.
///
/// Each call is independent; the facade keeps no per-submission state.

use crate::engine::{Attempt, ExecutionStrategy, ProcessEngine};
use crate::runner::InterpreterRunner;
use rgrader_common::config::GraderConfig;
use rgrader_common::types::{ExecutionResult, Submission};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, instrument, warn};

#[derive(Clone)]
pub struct Sandbox {
    primary: Option<Arc<dyn ExecutionStrategy>>,
    fallback: Arc<dyn ExecutionStrategy>,
    time_limit: Duration,
    memory_limit_mb: u32,
    base_libraries: BTreeSet<String>,
}

impl Sandbox {
    /// Subprocess-only sandbox driven by the configured interpreter
    pub fn from_config(config: &GraderConfig) -> Self {
        let engine = ProcessEngine::new(InterpreterRunner::from_config(config), config);
        Self::new(Arc::new(engine), config)
    }

    pub fn new(fallback: Arc<dyn ExecutionStrategy>, config: &GraderConfig) -> Self {
        Self {
            primary: None,
            fallback,
            time_limit: config.time_limit(),
            memory_limit_mb: config.memory_limit_mb,
            base_libraries: config.base_libraries.iter().cloned().collect(),
        }
    }

    /// Try `primary` first on every call; the host owns its lifecycle
    pub fn with_primary(mut self, primary: Arc<dyn ExecutionStrategy>) -> Self {
        self.primary = Some(primary);
        self
    }

    pub async fn execute(
        &self,
        student_code: &str,
        test_code: &str,
        libraries: &BTreeSet<String>,
    ) -> ExecutionResult {
        let submission = Submission {
            student_code: student_code.to_string(),
            test_code: test_code.to_string(),
            required_libraries: libraries.union(&self.base_libraries).cloned().collect(),
            time_limit: self.time_limit,
            memory_limit_mb: self.memory_limit_mb,
        };
        self.execute_submission(submission).await
    }

    #[instrument(skip_all, fields(libraries = submission.required_libraries.len()))]
    pub async fn execute_submission(&self, submission: Submission) -> ExecutionResult {
        let submission = Arc::new(submission);

        if let Some(primary) = &self.primary {
            match run_isolated(primary.clone(), submission.clone()).await {
                Ok(Attempt::Completed(result)) => return result,
                Ok(Attempt::Unavailable(reason)) => {
                    warn!(strategy = primary.name(), reason = %reason, "Strategy unavailable, falling back");
                }
                Ok(Attempt::Failed(reason)) => {
                    warn!(strategy = primary.name(), reason = %reason, "Strategy failed, falling back");
                }
                Err(panic) => {
                    warn!(strategy = primary.name(), error = %panic, "Strategy panicked, falling back");
                }
            }
        }

        let name = self.fallback.name();
        match run_isolated(self.fallback.clone(), submission).await {
            Ok(Attempt::Completed(result)) => result,
            Ok(Attempt::Unavailable(reason)) | Ok(Attempt::Failed(reason)) => {
                error!(strategy = name, reason = %reason, "No strategy could run the submission");
                ExecutionResult::system_error(reason)
            }
            Err(panic) => {
                error!(strategy = name, error = %panic, "Strategy panicked");
                ExecutionResult::system_error(format!("grading task panicked: {}", panic))
            }
        }
    }
}

/// Run one attempt on its own task so a panic surfaces as a `JoinError`
async fn run_isolated(
    strategy: Arc<dyn ExecutionStrategy>,
    submission: Arc<Submission>,
) -> Result<Attempt, tokio::task::JoinError> {
    tokio::spawn(async move { strategy.attempt(&submission).await }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockExecutionStrategy;
    use rgrader_common::types::{ExecutionStatus, SYSTEM_ERROR_MESSAGE};

    fn make_strategy(name: &'static str, times: usize, attempt: Attempt) -> Arc<dyn ExecutionStrategy> {
        let mut strategy = MockExecutionStrategy::new();
        strategy.expect_name().return_const(name);
        strategy
            .expect_attempt()
            .times(times)
            .returning(move |_| attempt.clone());
        Arc::new(strategy)
    }

    fn make_sandbox(fallback: Arc<dyn ExecutionStrategy>) -> Sandbox {
        Sandbox::new(fallback, &GraderConfig::default())
    }

    #[tokio::test]
    async fn test_fallback_only() {
        let fallback = make_strategy(
            "process",
            1,
            Attempt::Completed(ExecutionResult::success(100.0, "all passed")),
        );

        let result = make_sandbox(fallback).execute("x", "y", &BTreeSet::new()).await;

        assert!(result.is_success());
        assert_eq!(result.score, 100.0);
    }

    #[tokio::test]
    async fn test_primary_completed_is_final() {
        let primary = make_strategy(
            "embedded",
            1,
            Attempt::Completed(ExecutionResult::error("Error in student code: boom")),
        );
        let fallback = make_strategy("process", 0, Attempt::Unavailable("unused".into()));

        let result = make_sandbox(fallback)
            .with_primary(primary)
            .execute("x", "y", &BTreeSet::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.message, "Error in student code: boom");
    }

    #[tokio::test]
    async fn test_primary_unavailable_falls_back() {
        let primary = make_strategy("embedded", 1, Attempt::Unavailable("not initialized".into()));
        let fallback = make_strategy(
            "process",
            1,
            Attempt::Completed(ExecutionResult::success(50.0, "half")),
        );

        let result = make_sandbox(fallback)
            .with_primary(primary)
            .execute("x", "y", &BTreeSet::new())
            .await;

        assert_eq!(result.score, 50.0);
    }

    #[tokio::test]
    async fn test_primary_failure_falls_back() {
        let primary = make_strategy("embedded", 1, Attempt::Failed("bridge crashed".into()));
        let fallback = make_strategy(
            "process",
            1,
            Attempt::Completed(ExecutionResult::success(100.0, "ok")),
        );

        let result = make_sandbox(fallback)
            .with_primary(primary)
            .execute("x", "y", &BTreeSet::new())
            .await;

        assert!(result.is_success());
    }

    struct PanickingStrategy;

    #[async_trait::async_trait]
    impl ExecutionStrategy for PanickingStrategy {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn attempt(&self, _submission: &Submission) -> Attempt {
            panic!("interpreter state corrupted")
        }
    }

    #[tokio::test]
    async fn test_panicking_strategy_becomes_system_error() {
        let result = make_sandbox(Arc::new(PanickingStrategy))
            .execute("x", "y", &BTreeSet::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.message, SYSTEM_ERROR_MESSAGE);
        assert!(result.debug_info.contains("panicked"));
    }

    #[tokio::test]
    async fn test_panicking_primary_falls_back() {
        let fallback = make_strategy(
            "process",
            1,
            Attempt::Completed(ExecutionResult::success(100.0, "ok")),
        );

        let result = make_sandbox(fallback)
            .with_primary(Arc::new(PanickingStrategy))
            .execute("x", "y", &BTreeSet::new())
            .await;

        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_base_libraries_always_requested() {
        let mut fallback = MockExecutionStrategy::new();
        fallback.expect_name().return_const("process");
        fallback
            .expect_attempt()
            .withf(|submission| {
                submission.required_libraries.contains("jsonlite")
                    && submission.required_libraries.contains("dplyr")
            })
            .times(1)
            .returning(|_| Attempt::Completed(ExecutionResult::success(100.0, "ok")));

        let libraries = ["dplyr".to_string()].into_iter().collect();
        make_sandbox(Arc::new(fallback))
            .execute("x", "y", &libraries)
            .await;
    }
}
