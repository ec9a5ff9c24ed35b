mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rgrader-cli")]
#[command(about = "rgrader CLI - Grade R submissions locally and check the grading environment", long_about = None)]
struct Cli {
    /// Grader config file (defaults to config/grader.json, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade one submission against instructor test code
    Grade {
        /// Student code file
        #[arg(short, long)]
        code: PathBuf,

        /// Instructor test code file
        #[arg(short, long)]
        test: PathBuf,

        /// Points the question is worth
        #[arg(short, long, default_value = "100")]
        max_points: f64,

        /// Extra R library to load (repeatable)
        #[arg(short, long = "library")]
        libraries: Vec<String>,

        /// Override the time limit in seconds
        #[arg(long)]
        time_limit: Option<u64>,

        /// Print the full grading report as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Check the interpreter and library availability
    Check {
        /// Library to check in addition to the base libraries (repeatable)
        #[arg(short, long = "library")]
        libraries: Vec<String>,
    },

    /// Write a default grader configuration
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,

        /// Overwrite an existing configuration
        #[arg(long, default_value = "false")]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Grade {
            code,
            test,
            max_points,
            libraries,
            time_limit,
            json,
        } => {
            let config = commands::load_config(cli.config.as_deref(), time_limit)?;
            commands::grade(&config, &code, &test, max_points, libraries, json).await?;
        }
        Commands::Check { libraries } => {
            let config = commands::load_config(cli.config.as_deref(), None)?;
            commands::check(&config, libraries).await?;
        }
        Commands::Init { path, force } => {
            commands::init_project(&path, force)?;
        }
    }

    Ok(())
}
