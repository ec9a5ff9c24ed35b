/// Execution Engine - Strategies for Running a Submission
///
/// **Core Responsibility:**
/// Turn one `Submission` into one `ExecutionResult`.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (subprocess, embedded interpreter, ...)
/// - Engine does NOT know question points or feedback rules
/// - Engine reports back whether it could run at all (`Attempt`), so the
///   facade can decide whether to try another strategy
///
/// Production uses `ProcessEngine`: synthesize a working directory, run the
/// interpreter on the driver with a hard limit, decode `result.json`.

use crate::runner::{ProcessRunner, RunOutcome, RunSpec, Termination};
use crate::synthesizer::{self, SynthesisOptions};
use async_trait::async_trait;
use rgrader_common::config::GraderConfig;
use rgrader_common::protocol::{self, ResultFile, RESULT_FILE_NAME};
use rgrader_common::types::{ExecutionResult, Submission};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What a strategy managed to do with a request
#[derive(Debug, Clone)]
pub enum Attempt {
    /// Ran to a result (which may itself be an error or timeout)
    Completed(ExecutionResult),
    /// Strategy cannot be used right now (not initialized, torn down, ...)
    Unavailable(String),
    /// Strategy broke while running; another strategy may still succeed
    Failed(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, submission: &Submission) -> Attempt;
}

/// Subprocess strategy. Always completes: every failure becomes a result.
pub struct ProcessEngine<R: ProcessRunner> {
    runner: R,
    options: SynthesisOptions,
    kill_grace: Duration,
}

impl<R: ProcessRunner> ProcessEngine<R> {
    pub fn new(runner: R, config: &GraderConfig) -> Self {
        Self {
            runner,
            options: SynthesisOptions {
                temp_root: config.temp_root(),
                repos: config.repos.clone(),
                install_missing_libraries: config.install_missing_libraries,
                install_time_limit: config.install_time_limit(),
            },
            kill_grace: config.kill_grace(),
        }
    }

    pub async fn run(&self, submission: &Submission) -> ExecutionResult {
        let workspace = match synthesizer::synthesize(submission, &self.options) {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to prepare submission");
                return ExecutionResult::system_error(format!("{:#}", e));
            }
        };

        // The driver's own limit starts after library setup and fires first;
        // the external kill only backs it up
        let spec = RunSpec {
            script: workspace.driver_path(),
            work_dir: workspace.path().to_path_buf(),
            hard_limit: self.options.install_time_limit + submission.time_limit + self.kill_grace,
        };

        let outcome = self.runner.run(spec).await;
        let result = interpret(&outcome, &workspace.path().join(RESULT_FILE_NAME), submission.time_limit);

        info!(
            work_dir = %workspace.path().display(),
            libraries = ?workspace.libraries(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            exit_code = ?outcome.exit_code(),
            status = %result.status,
            score = result.score,
            "Submission executed"
        );

        // Workspace drops here, removing the directory
        result
    }
}

#[async_trait]
impl<R: ProcessRunner> ExecutionStrategy for ProcessEngine<R> {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn attempt(&self, submission: &Submission) -> Attempt {
        Attempt::Completed(self.run(submission).await)
    }
}

/// Map a finished process plus whatever it left on disk to a result
fn interpret(outcome: &RunOutcome, result_path: &std::path::Path, time_limit: Duration) -> ExecutionResult {
    if let Termination::LaunchFailed(reason) = &outcome.termination {
        return ExecutionResult::system_error(reason.clone());
    }

    match protocol::read_result_file(result_path) {
        ResultFile::Decoded(result) => {
            if outcome.timed_out() {
                // Result written just before the kill; it still counts
                debug!("Result file present despite hard kill");
            }
            result
        }
        ResultFile::Missing if outcome.timed_out() => {
            ExecutionResult::timeout(time_limit).with_output(process_output(outcome))
        }
        ResultFile::Missing => {
            warn!(exit_code = ?outcome.exit_code(), "No result file produced");
            protocol::no_result(&outcome.stdout, &outcome.stderr)
                .with_debug_info(format!("exit code: {}", describe_exit(outcome)))
        }
        ResultFile::Unreadable(reason) => {
            error!(reason = %reason, "Result file unreadable");
            ExecutionResult::system_error(reason).with_output(process_output(outcome))
        }
    }
}

fn process_output(outcome: &RunOutcome) -> String {
    match (outcome.stdout.trim().is_empty(), outcome.stderr.trim().is_empty()) {
        (true, true) => String::new(),
        (false, true) => outcome.stdout.clone(),
        (true, false) => outcome.stderr.clone(),
        (false, false) => format!("{}\n{}", outcome.stdout.trim_end(), outcome.stderr),
    }
}

fn describe_exit(outcome: &RunOutcome) -> String {
    match outcome.exit_code() {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}
