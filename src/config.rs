//! Layered configuration for phasegate.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. `phasegate.toml` (or the file given with `--config`)
//! 3. `PHASEGATE_*` environment variables (`.env` is loaded first)
//! 4. CLI flags, applied by the binary
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! dev = false
//!
//! [database]
//! path = ".phasegate/phasegate.db"
//!
//! [workflow]
//! phases = ["research"]
//! min_phase_tokens = 500
//! task_ttl_hours = 48
//! approval_ttl_hours = 24
//! sweep_interval_secs = 3600
//!
//! [breaker]
//! failure_threshold = 3
//! recovery_timeout_secs = 120
//! success_threshold = 3
//! call_timeout_secs = 30
//!
//! [logging]
//! level = "info"
//! json = false
//! directory = ""
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::orchestrator::{PhasePlan, WorkflowSettings};

pub const DEFAULT_CONFIG_FILE: &str = "phasegate.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for local front-ends.
    pub dev: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            dev: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".phasegate/phasegate.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowSection {
    /// Ordered phase list; every phase pauses for approval.
    pub phases: Vec<String>,
    pub min_phase_tokens: i64,
    pub task_ttl_hours: i64,
    pub approval_ttl_hours: i64,
    pub sweep_interval_secs: u64,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            phases: vec!["research".to_string()],
            min_phase_tokens: 500,
            task_ttl_hours: 48,
            approval_ttl_hours: 24,
            sweep_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,
    pub call_timeout_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 120,
            success_threshold: 3,
            call_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub json: bool,
    /// Daily rolling log files go here; empty means stderr only.
    pub directory: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PhasegateConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub workflow: WorkflowSection,
    pub breaker: BreakerSection,
    pub logging: LoggingSection,
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: '{}'", key, raw))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Invalid value for {}: '{}'", key, raw),
    }
}

impl PhasegateConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse phasegate.toml")
    }

    /// File (explicit path, else `phasegate.toml` if present, else defaults),
    /// then process environment. Does not validate.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay `PHASEGATE_*` values returned by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PHASEGATE_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("PHASEGATE_PORT") {
            self.server.port = parse_env("PHASEGATE_PORT", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_DEV") {
            self.server.dev = parse_bool("PHASEGATE_DEV", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PHASEGATE_PHASES") {
            self.workflow.phases = v
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        if let Some(v) = lookup("PHASEGATE_MIN_PHASE_TOKENS") {
            self.workflow.min_phase_tokens = parse_env("PHASEGATE_MIN_PHASE_TOKENS", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_TASK_TTL_HOURS") {
            self.workflow.task_ttl_hours = parse_env("PHASEGATE_TASK_TTL_HOURS", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_APPROVAL_TTL_HOURS") {
            self.workflow.approval_ttl_hours = parse_env("PHASEGATE_APPROVAL_TTL_HOURS", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_SWEEP_INTERVAL_SECS") {
            self.workflow.sweep_interval_secs = parse_env("PHASEGATE_SWEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_BREAKER_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold = parse_env("PHASEGATE_BREAKER_FAILURE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_BREAKER_RECOVERY_TIMEOUT_SECS") {
            self.breaker.recovery_timeout_secs =
                parse_env("PHASEGATE_BREAKER_RECOVERY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_BREAKER_SUCCESS_THRESHOLD") {
            self.breaker.success_threshold = parse_env("PHASEGATE_BREAKER_SUCCESS_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_BREAKER_CALL_TIMEOUT_SECS") {
            self.breaker.call_timeout_secs = parse_env("PHASEGATE_BREAKER_CALL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("PHASEGATE_JSON_LOGS") {
            self.logging.json = parse_bool("PHASEGATE_JSON_LOGS", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_LOG_DIR") {
            self.logging.directory = v;
        }
        Ok(())
    }

    /// Validate the configuration. Returns a list of problems; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = PhasePlan::new(self.workflow.phases.clone()) {
            errors.push(format!("workflow.phases: {}", e));
        }
        if self.workflow.min_phase_tokens <= 0 {
            errors.push("workflow.min_phase_tokens must be positive".to_string());
        }
        if self.workflow.task_ttl_hours <= 0 {
            errors.push("workflow.task_ttl_hours must be positive".to_string());
        }
        if self.workflow.approval_ttl_hours <= 0 {
            errors.push("workflow.approval_ttl_hours must be positive".to_string());
        }
        if self.workflow.sweep_interval_secs == 0 {
            errors.push("workflow.sweep_interval_secs must be positive".to_string());
        }
        if self.breaker.failure_threshold == 0 {
            errors.push("breaker.failure_threshold must be at least 1".to_string());
        }
        if self.breaker.success_threshold == 0 {
            errors.push("breaker.success_threshold must be at least 1".to_string());
        }
        if self.breaker.recovery_timeout_secs == 0 {
            errors.push("breaker.recovery_timeout_secs must be positive".to_string());
        }
        if self.breaker.call_timeout_secs == 0 {
            errors.push("breaker.call_timeout_secs must be positive".to_string());
        }
        if self.server.host.trim().is_empty() {
            errors.push("server.host cannot be empty".to_string());
        }

        errors
    }

    /// Bail with every validation problem at once.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            return Ok(());
        }
        anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "))
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            recovery_timeout: Duration::from_secs(self.breaker.recovery_timeout_secs),
            success_threshold: self.breaker.success_threshold,
            call_timeout: Duration::from_secs(self.breaker.call_timeout_secs),
        }
    }

    pub fn workflow_settings(&self) -> Result<WorkflowSettings> {
        let plan = PhasePlan::new(self.workflow.phases.clone()).map_err(anyhow::Error::msg)?;
        Ok(WorkflowSettings {
            plan,
            min_phase_tokens: self.workflow.min_phase_tokens,
            task_ttl: chrono::Duration::hours(self.workflow.task_ttl_hours),
            approval_ttl: chrono::Duration::hours(self.workflow.approval_ttl_hours),
        })
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.workflow.sweep_interval_secs)
    }
}
