/// Process Runner - Supervised Interpreter Subprocess
///
/// **Core Responsibility:**
/// Launch the interpreter on a script inside a working directory, capture its
/// output streams, and enforce a hard wall-clock limit.
///
/// **Guarantees:**
/// - Fresh process per call, never reused
/// - Child environment is built from scratch (`env_clear`) and pinned: PATH, locale,
///   HOME/TMPDIR inside the working directory, optional R_HOME/R_LIBS
/// - Child runs in its own process group; on timeout the whole group is killed
/// - Streams are drained concurrently so a chatty child never blocks on a full pipe;
///   only the first `capture_limit` bytes of each stream are kept
/// - Never returns an error: launch failures are reported through `Termination`

use async_trait::async_trait;
use rgrader_common::config::GraderConfig;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// How long to wait for the stream readers after a kill
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub const TRUNCATION_MARKER: &str = "\n...[output truncated]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own; `None` when killed by a signal
    Exited(Option<i32>),
    /// Killed after exceeding the hard limit
    TimedOut,
    /// Could not be started at all
    LaunchFailed(String),
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl RunOutcome {
    fn launch_failed(reason: String) -> Self {
        Self {
            termination: Termination::LaunchFailed(reason),
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.termination == Termination::TimedOut
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited(code) => code,
            _ => None,
        }
    }
}

/// Everything needed to launch one interpreter process
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub script: PathBuf,
    pub work_dir: PathBuf,
    /// Hard wall-clock limit, already including any grace margin
    pub hard_limit: Duration,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: RunSpec) -> RunOutcome;
}

/// Runs the configured interpreter with a pinned environment
#[derive(Debug, Clone)]
pub struct InterpreterRunner {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    capture_limit: usize,
}

impl InterpreterRunner {
    pub fn from_config(config: &GraderConfig) -> Self {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), config.path.clone());
        env.insert("LC_ALL".to_string(), config.locale.clone());
        env.insert("LANG".to_string(), config.locale.clone());
        if let Some(home) = &config.r_home {
            env.insert("R_HOME".to_string(), home.display().to_string());
        }
        if let Some(libs) = &config.r_libs {
            env.insert("R_LIBS".to_string(), libs.display().to_string());
        }
        for (key, value) in &config.extra_env {
            env.insert(key.clone(), value.clone());
        }

        Self {
            program: config.interpreter.clone(),
            args: config.interpreter_args.clone(),
            env,
            capture_limit: config.capture_limit_bytes,
        }
    }

    /// Runner for an arbitrary program with no extra arguments
    pub fn with_program(program: impl Into<String>, config: &GraderConfig) -> Self {
        let mut runner = Self::from_config(config);
        runner.program = program.into();
        runner.args.clear();
        runner
    }

    fn command(&self, spec: &RunSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&spec.script)
            .arg(&spec.work_dir)
            .current_dir(&spec.work_dir)
            .env_clear()
            .envs(&self.env)
            .env("HOME", &spec.work_dir)
            .env("TMPDIR", &spec.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl ProcessRunner for InterpreterRunner {
    async fn run(&self, spec: RunSpec) -> RunOutcome {
        let start = Instant::now();

        let mut child = match self.command(&spec).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(program = %self.program, error = %e, "Failed to launch interpreter");
                return RunOutcome::launch_failed(format!("failed to launch {}: {}", self.program, e));
            }
        };
        let pid = child.id();
        debug!(pid = ?pid, work_dir = %spec.work_dir.display(), "Interpreter started");

        let stdout_reader = spawn_capture(child.stdout.take(), self.capture_limit);
        let stderr_reader = spawn_capture(child.stderr.take(), self.capture_limit);

        let termination = match timeout(spec.hard_limit, child.wait()).await {
            Ok(Ok(status)) => Termination::Exited(status.code()),
            Ok(Err(e)) => {
                error!(pid = ?pid, error = %e, "Failed waiting on interpreter");
                kill_group(pid);
                let _ = child.kill().await;
                Termination::Exited(None)
            }
            Err(_) => {
                warn!(
                    pid = ?pid,
                    limit_ms = spec.hard_limit.as_millis() as u64,
                    "Hard limit exceeded, killing process group"
                );
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    debug!(pid = ?pid, error = %e, "Kill after group kill");
                }
                Termination::TimedOut
            }
        };

        // Background children left behind by the script go with the group
        if termination != Termination::TimedOut {
            kill_group(pid);
        }
        let stdout = collect(stdout_reader, READER_DRAIN_TIMEOUT).await;
        let stderr = collect(stderr_reader, READER_DRAIN_TIMEOUT).await;

        let elapsed = start.elapsed();
        debug!(
            pid = ?pid,
            elapsed_ms = elapsed.as_millis() as u64,
            termination = ?termination,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Interpreter finished"
        );

        RunOutcome {
            termination,
            stdout,
            stderr,
            elapsed,
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // The child leads its own group (process_group(0)), so pgid == pid
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// Bytes kept from one output stream
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn to_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// A stream being drained in the background; the buffer outlives the reader task
struct StreamCapture {
    buffer: Arc<Mutex<Captured>>,
    reader: JoinHandle<()>,
}

fn spawn_capture<R>(stream: Option<R>, limit: usize) -> Option<StreamCapture>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut stream = stream?;
    let buffer = Arc::new(Mutex::new(Captured::default()));
    let sink = buffer.clone();
    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
                    captured.push(&buf[..n], limit);
                }
            }
        }
    });
    Some(StreamCapture { buffer, reader })
}

/// Whatever the stream produced, even when its reader has to be abandoned
async fn collect(capture: Option<StreamCapture>, wait: Duration) -> String {
    let Some(StreamCapture { buffer, mut reader }) = capture else {
        return String::new();
    };
    match timeout(wait, &mut reader).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Output reader task failed"),
        Err(_) => {
            reader.abort();
            warn!("Output reader did not finish after kill, keeping partial output");
        }
    }
    let captured = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    captured.to_text()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn make_config() -> GraderConfig {
        GraderConfig {
            capture_limit_bytes: 64,
            ..GraderConfig::default()
        }
    }

    fn make_script(dir: &Path, body: &str) -> RunSpec {
        let script = dir.join("run.sh");
        fs::write(&script, body).unwrap();
        RunSpec {
            script,
            work_dir: dir.to_path_buf(),
            hard_limit: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_exit_code_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let runner = InterpreterRunner::with_program("/bin/sh", &make_config());
        let spec = make_script(dir.path(), "echo out; echo err >&2; exit 3\n");

        let outcome = runner.run(spec).await;

        assert_eq!(outcome.termination, Termination::Exited(Some(3)));
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_pinned_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = make_config();
        config.capture_limit_bytes = 4096;
        config.extra_env.insert("GRADER_MARK".to_string(), "42".to_string());
        std::env::set_var("RGRADER_TEST_LEAK", "leaked");
        let runner = InterpreterRunner::with_program("/bin/sh", &config);
        let spec = make_script(
            dir.path(),
            "echo \"$LC_ALL|$GRADER_MARK|${RGRADER_TEST_LEAK:-unset}|$HOME\"\n",
        );

        let outcome = runner.run(spec).await;

        let expected = format!("C|42|unset|{}", dir.path().display());
        assert_eq!(outcome.stdout.trim(), expected);
    }

    #[tokio::test]
    async fn test_output_capped() {
        let dir = tempfile::tempdir().unwrap();
        let runner = InterpreterRunner::with_program("/bin/sh", &make_config());
        let spec = make_script(dir.path(), "i=0; while [ $i -lt 200 ]; do echo xxxxxxxxxx; i=$((i+1)); done\n");

        let outcome = runner.run(spec).await;

        assert_eq!(outcome.termination, Termination::Exited(Some(0)));
        assert!(outcome.stdout.ends_with(TRUNCATION_MARKER));
        assert_eq!(outcome.stdout.len(), 64 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let runner = InterpreterRunner::with_program("/bin/sh", &make_config());
        let mut spec = make_script(dir.path(), "sleep 30 &\nsleep 30\n");
        spec.hard_limit = Duration::from_millis(300);

        let outcome = tokio::time::timeout(Duration::from_secs(10), runner.run(spec))
            .await
            .expect("runner must return promptly after the hard limit");

        assert!(outcome.timed_out());
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stalled_stream_keeps_partial_output() {
        use tokio::io::AsyncWriteExt;

        let (mut writer, reader) = tokio::io::duplex(1024);
        let capture = spawn_capture(Some(reader), 64);
        writer.write_all(b"partial line\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Writer still open, so the reader never sees end of stream
        let text = collect(capture, Duration::from_millis(200)).await;

        assert_eq!(text, "partial line\n");
        drop(writer);
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = InterpreterRunner::with_program("/nonexistent/interpreter", &make_config());
        let spec = make_script(dir.path(), "");

        let outcome = runner.run(spec).await;

        assert!(matches!(outcome.termination, Termination::LaunchFailed(_)));
    }
}
