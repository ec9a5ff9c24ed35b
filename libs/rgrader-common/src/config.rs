// Grader configuration: interpreter, limits, pinned child environment
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/grader.json";
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub time_limit_secs: u64,
    pub kill_grace_secs: u64,
    /// Advisory; exported to the driver but never enforced
    pub memory_limit_mb: u32,
    pub feedback_output_limit: usize,
    pub capture_limit_bytes: usize,
    pub base_libraries: Vec<String>,
    pub install_missing_libraries: bool,
    /// Budget for installing missing libraries, on top of the execution time limit
    pub install_time_limit_secs: u64,
    pub repos: String,
    pub locale: String,
    pub path: String,
    pub r_home: Option<PathBuf>,
    pub r_libs: Option<PathBuf>,
    pub extra_env: BTreeMap<String, String>,
    pub temp_root: Option<PathBuf>,
    pub max_concurrency: usize,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            interpreter: "Rscript".to_string(),
            interpreter_args: vec!["--vanilla".to_string()],
            time_limit_secs: 10,
            kill_grace_secs: 5,
            memory_limit_mb: 500,
            feedback_output_limit: 5000,
            capture_limit_bytes: 1024 * 1024,
            base_libraries: vec!["jsonlite".to_string()],
            install_missing_libraries: true,
            install_time_limit_secs: 60,
            repos: "https://cloud.r-project.org".to_string(),
            locale: "C".to_string(),
            // Captured once here so later changes to our own env never leak into children
            path: env::var("PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| FALLBACK_PATH.to_string()),
            r_home: None,
            r_libs: None,
            extra_env: BTreeMap::new(),
            temp_root: None,
            max_concurrency: 4,
        }
    }
}

impl GraderConfig {
    /// Load configuration from a JSON file; absent keys take their defaults
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Grader config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: GraderConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load config/grader.json when present, built-in defaults otherwise
    pub fn load_default() -> Result<Self> {
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            Self::load(default_path)
        } else {
            tracing::debug!("No {} found, using built-in defaults", DEFAULT_CONFIG_PATH);
            Ok(Self::default())
        }
    }

    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(interpreter) = env::var("RGRADER_INTERPRETER") {
            self.interpreter = interpreter;
        }
        if let Ok(secs) = env::var("RGRADER_TIME_LIMIT_SECS") {
            self.time_limit_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("Invalid RGRADER_TIME_LIMIT_SECS: {}", secs))?;
        }
        if let Ok(n) = env::var("RGRADER_MAX_CONCURRENCY") {
            self.max_concurrency = n
                .trim()
                .parse()
                .with_context(|| format!("Invalid RGRADER_MAX_CONCURRENCY: {}", n))?;
        }
        if let Ok(root) = env::var("RGRADER_TEMP_ROOT") {
            self.temp_root = Some(PathBuf::from(root));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interpreter.trim().is_empty() {
            bail!("interpreter must not be empty");
        }
        if self.time_limit_secs == 0 {
            bail!("time_limit_secs must be greater than zero");
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be greater than zero");
        }
        // Both end up in line-oriented files read by the driver
        for (name, value) in [("repos", &self.repos), ("locale", &self.locale)] {
            if value.contains('\n') || value.contains('\r') {
                bail!("{} must not contain line breaks", name);
            }
        }
        Ok(())
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Zero when installation is disabled
    pub fn install_time_limit(&self) -> Duration {
        if self.install_missing_libraries {
            Duration::from_secs(self.install_time_limit_secs)
        } else {
            Duration::ZERO
        }
    }

    /// Parent directory for per-submission working directories
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(env::temp_dir)
    }
}
