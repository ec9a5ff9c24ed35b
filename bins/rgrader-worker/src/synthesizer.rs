/// Script Synthesizer - Per-Submission Working Directory
///
/// **Core Responsibility:**
/// Lay out everything the interpreter needs for one grading run:
///
/// ```text
/// rgrader-XXXXXX/
///   driver.R      fixed grading driver (embedded in the binary)
///   grader.dcf    run settings
///   student.R     cleaned student code
///   test.R        cleaned test code
/// ```
///
/// **Why files, not a template:**
/// Student and test code are untrusted text. They are written verbatim (after
/// cleaning) into their own files and read by the driver with `parse(file = ...)`,
/// so no quoting or escaping of untrusted text into interpreter source ever happens.
///
/// The directory is owned by the returned `Workspace` and removed on drop.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use rgrader_common::types::Submission;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, warn};

pub const DRIVER_SOURCE: &str = include_str!("../assets/driver.R");

pub const DRIVER_FILE: &str = "driver.R";
pub const SETTINGS_FILE: &str = "grader.dcf";
pub const STUDENT_FILE: &str = "student.R";
pub const TEST_FILE: &str = "test.R";

static LIBRARY_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9.]*$").expect("valid regex"));

/// Settings the synthesizer needs besides the submission itself
#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    pub temp_root: PathBuf,
    pub repos: String,
    pub install_missing_libraries: bool,
    pub install_time_limit: Duration,
}

/// A prepared working directory; deleted when dropped
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    libraries: Vec<String>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn driver_path(&self) -> PathBuf {
        self.dir.path().join(DRIVER_FILE)
    }

    /// Libraries that passed validation and were handed to the driver
    pub fn libraries(&self) -> &[String] {
        &self.libraries
    }
}

/// Build the working directory for one submission
pub fn synthesize(submission: &Submission, options: &SynthesisOptions) -> Result<Workspace> {
    fs::create_dir_all(&options.temp_root).with_context(|| {
        format!("Failed to create temp root {}", options.temp_root.display())
    })?;

    let dir = tempfile::Builder::new()
        .prefix("rgrader-")
        .tempdir_in(&options.temp_root)
        .context("Failed to create submission working directory")?;

    let libraries = valid_libraries(&submission.required_libraries);

    fs::write(dir.path().join(DRIVER_FILE), DRIVER_SOURCE).context("Failed to write driver")?;
    fs::write(
        dir.path().join(SETTINGS_FILE),
        render_settings(submission, options, &libraries),
    )
    .context("Failed to write settings")?;
    fs::write(dir.path().join(STUDENT_FILE), clean_source(&submission.student_code))
        .context("Failed to write student code")?;
    fs::write(dir.path().join(TEST_FILE), clean_source(&submission.test_code))
        .context("Failed to write test code")?;

    debug!(
        work_dir = %dir.path().display(),
        libraries = ?libraries,
        student_bytes = submission.student_code.len(),
        test_bytes = submission.test_code.len(),
        "Workspace prepared"
    );

    Ok(Workspace { dir, libraries })
}

/// Strip a BOM and control characters other than tab/newline, normalize line endings
pub fn clean_source(source: &str) -> String {
    let source = source.strip_prefix('\u{feff}').unwrap_or(source);
    let source = source.replace("\r\n", "\n").replace('\r', "\n");
    source
        .chars()
        .filter(|c| !c.is_ascii_control() || *c == '\n' || *c == '\t')
        .collect()
}

pub fn is_valid_library_name(name: &str) -> bool {
    LIBRARY_NAME.is_match(name) && !name.ends_with('.')
}

fn valid_libraries(requested: &BTreeSet<String>) -> Vec<String> {
    requested
        .iter()
        .map(|name| name.trim())
        .filter(|name| {
            let ok = is_valid_library_name(name);
            if !ok {
                warn!(library = %name, "Dropping invalid library name");
            }
            ok
        })
        .map(str::to_string)
        .collect()
}

fn render_settings(submission: &Submission, options: &SynthesisOptions, libraries: &[String]) -> String {
    format!(
        "TimeLimit: {}\nMemoryLimitMb: {}\nRepos: {}\nInstallMissing: {}\nInstallTimeLimit: {}\nLibraries: {}\n",
        submission.time_limit.as_secs().max(1),
        submission.memory_limit_mb,
        single_line(&options.repos),
        if options.install_missing_libraries { "yes" } else { "no" },
        options.install_time_limit.as_secs(),
        libraries.join(", "),
    )
}

fn single_line(value: &str) -> String {
    value.chars().filter(|c| !c.is_control()).collect()
}
