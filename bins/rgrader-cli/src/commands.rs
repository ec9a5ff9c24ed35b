// CLI commands for grading locally and checking the R environment
use anyhow::{bail, Context, Result};
use rgrader_common::config::{GraderConfig, DEFAULT_CONFIG_PATH};
use rgrader_common::types::{ExecutionStatus, Question};
use rgrader_worker::runner::{InterpreterRunner, ProcessRunner, RunSpec, Termination};
use rgrader_worker::synthesizer::is_valid_library_name;
use rgrader_worker::Grader;
use std::fs;
use std::path::Path;
use std::time::Duration;

const PROBE_SOURCE: &str = include_str!("../assets/probe.R");
const PROBE_TIME_LIMIT: Duration = Duration::from_secs(60);

/// Explicit file, else config/grader.json, else defaults; env overrides on top
pub fn load_config(path: Option<&Path>, time_limit: Option<u64>) -> Result<GraderConfig> {
    let config = match path {
        Some(path) => GraderConfig::load(path)?,
        None => GraderConfig::load_default()?,
    };
    let mut config = config.apply_env_overrides()?;
    if let Some(secs) = time_limit {
        config.time_limit_secs = secs;
        config.validate()?;
    }
    Ok(config)
}

pub async fn grade(
    config: &GraderConfig,
    code_path: &Path,
    test_path: &Path,
    max_points: f64,
    libraries: Vec<String>,
    json: bool,
) -> Result<()> {
    let code = fs::read_to_string(code_path)
        .with_context(|| format!("Failed to read student code: {}", code_path.display()))?;
    let test = fs::read_to_string(test_path)
        .with_context(|| format!("Failed to read test code: {}", test_path.display()))?;

    let mut question = Question::programming(test, max_points);
    question.required_libraries = libraries.into_iter().collect();

    if !json {
        println!("🚀 Grading {} against {}", code_path.display(), test_path.display());
        println!("  Interpreter: {}", config.interpreter);
        println!("  Time limit: {}s", config.time_limit_secs);
        println!();
    }

    let grader = Grader::from_config(config);
    let report = grader.grade_with_report(&code, &question).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let icon = match report.result.as_ref().map(|r| r.status) {
        Some(ExecutionStatus::Success) => "✅",
        Some(ExecutionStatus::Timeout) => "⏱️ ",
        Some(ExecutionStatus::Error) => "❌",
        None => "⚠️ ",
    };
    println!("{} Points: {} / {}", icon, report.answer.points_earned, max_points);
    println!("\n📋 Feedback:\n{}", report.answer.feedback);

    if let Some(result) = &report.result {
        if !result.debug_info.is_empty() {
            println!("\n🔍 Debug info:\n{}", result.debug_info);
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq)]
struct ProbeReport {
    version: String,
    libraries: Vec<(String, bool)>,
}

fn parse_probe_output(stdout: &str) -> Option<ProbeReport> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let version = lines.next()?.to_string();
    let libraries = lines
        .filter_map(|line| {
            let (name, status) = line.rsplit_once(' ')?;
            Some((name.to_string(), status == "ok"))
        })
        .collect();
    Some(ProbeReport { version, libraries })
}

pub async fn check(config: &GraderConfig, extra: Vec<String>) -> Result<()> {
    println!("🔍 Checking R grading environment");
    println!("  Interpreter: {}", config.interpreter);
    println!("  PATH: {}", config.path);

    let mut libraries = config.base_libraries.clone();
    for name in extra {
        if !is_valid_library_name(&name) {
            println!("  ⚠️  Skipping invalid library name: {:?}", name);
            continue;
        }
        if !libraries.contains(&name) {
            libraries.push(name);
        }
    }

    let dir = tempfile::Builder::new()
        .prefix("rgrader-check-")
        .tempdir_in(config.temp_root())
        .context("Failed to create probe directory")?;
    let script = dir.path().join("probe.R");
    fs::write(&script, PROBE_SOURCE).context("Failed to write probe script")?;
    fs::write(dir.path().join("libraries.txt"), libraries.join("\n"))
        .context("Failed to write library list")?;

    let runner = InterpreterRunner::from_config(config);
    let outcome = runner
        .run(RunSpec {
            script,
            work_dir: dir.path().to_path_buf(),
            hard_limit: PROBE_TIME_LIMIT,
        })
        .await;

    match &outcome.termination {
        Termination::LaunchFailed(reason) => {
            println!("❌ {}", reason);
            bail!("Interpreter '{}' could not be started", config.interpreter);
        }
        Termination::TimedOut => bail!("Probe did not finish within {}s", PROBE_TIME_LIMIT.as_secs()),
        Termination::Exited(code) if *code != Some(0) => {
            println!("❌ Probe exited with {:?}", code);
            if !outcome.stderr.trim().is_empty() {
                println!("{}", outcome.stderr.trim_end());
            }
            bail!("Interpreter probe failed");
        }
        Termination::Exited(_) => {}
    }

    let report = parse_probe_output(&outcome.stdout).context("Probe produced no output")?;
    println!("  ✅ {}", report.version);

    let mut missing = 0;
    for (name, available) in &report.libraries {
        if *available {
            println!("  ✅ {}", name);
        } else {
            missing += 1;
            println!("  ❌ {} (not installed)", name);
        }
    }

    if missing == 0 {
        println!("\n✅ Environment ready");
    } else if config.install_missing_libraries {
        println!(
            "\n⚠️  {} library(ies) missing; the driver will try to install them from {}",
            missing, config.repos
        );
    } else {
        println!("\n⚠️  {} library(ies) missing and installation is disabled", missing);
    }

    Ok(())
}

pub fn init_project(path: &str, force: bool) -> Result<()> {
    println!("🚀 Initializing rgrader configuration at: {}", path);

    let project_path = Path::new(path);
    let config_path = project_path.join(DEFAULT_CONFIG_PATH);
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    if config_path.exists() && !force {
        println!("  ⚠️  {} already exists (use --force to overwrite)", config_path.display());
        return Ok(());
    }

    let content = serde_json::to_string_pretty(&GraderConfig::default())?;
    fs::write(&config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("  ✅ Created: {}", DEFAULT_CONFIG_PATH);

    println!("\n📋 Next steps:");
    println!("  1. Check the environment: rgrader-cli check");
    println!("  2. Grade a submission: rgrader-cli grade --code answer.R --test test.R");

    Ok(())
}
