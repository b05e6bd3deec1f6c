//! Configuration for cascade, read from `.cascade/cascade.toml`.
//!
//! Every field has a default, so a missing or partial file is valid.
//! Values are layered file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [run]
//! retry_budget = 3
//! validation_threshold = 0.8
//! stage_timeout_secs = 60
//! snapshot_joins = true
//!
//! [snapshots]
//! ttl_secs = 86400
//! persist = true
//!
//! [stages.overrides."section.*"]
//! timeout_secs = 10
//!
//! [groups.sections]
//! cancel_siblings_on_error = false
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use crate::graph::{GroupPolicy, StageId};
use crate::scheduler::SchedulerConfig;
use crate::snapshot::SnapshotCache;
use crate::util::glob_match;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project directory holding configuration and run data.
pub const CASCADE_DIR: &str = ".cascade";

pub const CONFIG_FILE: &str = "cascade.toml";

/// Environment variable overriding `[run] retry_budget`.
pub const RETRY_BUDGET_ENV: &str = "CASCADE_RETRY_BUDGET";

/// Run-level defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    /// Repairs allowed after the first failed validation
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Minimum validator score for a run to pass
    #[serde(default = "default_validation_threshold")]
    pub validation_threshold: f64,
    /// Default per-stage timeout in seconds
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,
    /// Snapshot automatically after every join stage
    #[serde(default = "default_true")]
    pub snapshot_joins: bool,
}

fn default_retry_budget() -> u32 {
    crate::repair::DEFAULT_RETRY_BUDGET
}

fn default_validation_threshold() -> f64 {
    crate::repair::DEFAULT_THRESHOLD
}

fn default_true() -> bool {
    true
}

fn default_ttl_secs() -> Option<u64> {
    Some(86_400)
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            validation_threshold: default_validation_threshold(),
            stage_timeout_secs: None,
            snapshot_joins: true,
        }
    }
}

/// Snapshot cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotsSection {
    /// Seconds a snapshot stays resumable; unset keeps snapshots until invalidated
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: Option<u64>,
    /// Write snapshots to disk so later processes can resume from them
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for SnapshotsSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            persist: true,
        }
    }
}

/// Stage-specific override settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagesSection {
    /// Pattern-based overrides (e.g., "section.*" -> StageOverride)
    #[serde(default)]
    pub overrides: BTreeMap<String, StageOverride>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Parsed `cascade.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeToml {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub snapshots: SnapshotsSection,
    #[serde(default)]
    pub stages: StagesSection,
    /// Failure policy per parallel group id
    #[serde(default)]
    pub groups: BTreeMap<String, GroupPolicy>,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl CascadeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cascade.toml")
    }

    /// Load `cascade.toml` from `cascade_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(cascade_dir: &Path) -> Result<Self> {
        let config_path = cascade_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize cascade.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Timeout for `stage`: first matching override, else the run default.
    pub fn stage_timeout(&self, stage: &str) -> Option<Duration> {
        self.stages
            .overrides
            .iter()
            .find(|(pattern, o)| o.timeout_secs.is_some() && glob_match(pattern, stage))
            .and_then(|(_, o)| o.timeout_secs)
            .or(self.run.stage_timeout_secs)
            .map(Duration::from_secs)
    }

    pub fn group_policy(&self, group: &str) -> GroupPolicy {
        self.groups.get(group).copied().unwrap_or_default()
    }

    pub fn snapshot_ttl(&self) -> Option<Duration> {
        self.snapshots.ttl_secs.map(Duration::from_secs)
    }

    /// Scheduler settings derived from `[run]` and `[stages]`.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::default()
            .with_default_timeout(self.run.stage_timeout_secs.map(Duration::from_secs))
            .with_snapshot_joins(self.run.snapshot_joins);
        for (pattern, override_cfg) in &self.stages.overrides {
            if let Some(secs) = override_cfg.timeout_secs {
                config = config.with_stage_timeout(pattern.clone(), Duration::from_secs(secs));
            }
        }
        config
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let threshold = self.run.validation_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            warnings.push(format!(
                "validation_threshold {} is outside [0, 1]; validator scores are clamped to that range",
                threshold
            ));
        }
        if self.run.stage_timeout_secs == Some(0) {
            warnings.push("stage_timeout_secs = 0 makes every stage time out".to_string());
        }
        if self.snapshots.ttl_secs == Some(0) {
            warnings.push("snapshots.ttl_secs = 0 expires snapshots immediately".to_string());
        }

        for (pattern, override_cfg) in &self.stages.overrides {
            if pattern.is_empty() {
                warnings.push("Empty stage override pattern never matches".to_string());
            }
            if override_cfg.timeout_secs == Some(0) {
                warnings.push(format!(
                    "timeout_secs = 0 in override for pattern '{}' makes matching stages time out",
                    pattern
                ));
            }
        }

        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging level '{}'", self.logging.level));
        }

        warnings
    }
}

/// Parse a retry budget from its environment representation.
pub fn parse_retry_budget(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct CascadeConfig {
    pub project_dir: PathBuf,
    pub cascade_dir: PathBuf,
    pub toml: CascadeToml,
    /// CLI override for `[run] retry_budget`
    pub cli_retry_budget: Option<u32>,
    /// CLI override for `[logging] level`
    pub cli_log_level: Option<String>,
}

impl CascadeConfig {
    /// Create a CascadeConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let cascade_dir = project_dir.join(CASCADE_DIR);
        let toml = CascadeToml::load_or_default(&cascade_dir)?;

        Ok(Self {
            project_dir,
            cascade_dir,
            toml,
            cli_retry_budget: None,
            cli_log_level: None,
        })
    }

    /// Create CascadeConfig with CLI overrides.
    pub fn with_cli_args(
        project_dir: PathBuf,
        retry_budget: Option<u32>,
        log_level: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_retry_budget = retry_budget;
        config.cli_log_level = log_level;
        Ok(config)
    }

    /// Retry budget (CLI → env → file).
    pub fn retry_budget(&self) -> u32 {
        self.resolve_retry_budget(std::env::var(RETRY_BUDGET_ENV).ok().as_deref())
    }

    fn resolve_retry_budget(&self, env: Option<&str>) -> u32 {
        self.cli_retry_budget
            .or_else(|| env.and_then(parse_retry_budget))
            .unwrap_or(self.toml.run.retry_budget)
    }

    pub fn validation_threshold(&self) -> f64 {
        self.toml.run.validation_threshold
    }

    /// Log level (CLI → file). `CASCADE_LOG` is applied by the subscriber.
    pub fn log_level(&self) -> &str {
        self.cli_log_level
            .as_deref()
            .unwrap_or(&self.toml.logging.level)
    }

    pub fn log_format(&self) -> LogFormat {
        self.toml.logging.format
    }

    pub fn config_file(&self) -> PathBuf {
        self.cascade_dir.join(CONFIG_FILE)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.cascade_dir.join("snapshots")
    }

    /// Run reports, one `<run-id>.json` each.
    pub fn runs_dir(&self) -> PathBuf {
        self.cascade_dir.join("runs")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.cascade_dir.join("artifacts")
    }

    pub fn is_initialized(&self) -> bool {
        self.config_file().exists()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.snapshots_dir(), self.runs_dir(), self.artifacts_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        self.toml.scheduler_config()
    }

    /// Snapshot cache with the configured TTL, persisted when enabled.
    pub fn snapshot_cache(&self) -> SnapshotCache {
        let cache = SnapshotCache::new(self.toml.snapshot_ttl());
        if self.toml.snapshots.persist {
            cache.with_persistence(self.snapshots_dir())
        } else {
            cache
        }
    }

    /// Effective timeout for `stage` after pattern overrides.
    pub fn stage_timeout(&self, stage: &StageId) -> Option<Duration> {
        self.toml.stage_timeout(stage)
    }
}
