//! Configuration types for the Smithers engine.
//!
//! Every section and field is optional in YAML; missing values fall back to
//! the defaults documented on each field.

use serde::{Deserialize, Serialize};
use smithers_proto::RetryPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration, usually loaded from `smithers.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmithersConfig {
    /// Frame driver budgets and debounce windows.
    #[serde(default, rename = "loop")]
    pub loop_config: LoopConfig,

    /// Run-wide tool retry policy. Nodes may override it.
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub debug: DebugConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub approvals: ApprovalConfig,
}

impl SmithersConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path_ref)?;
        let config: Self = serde_yaml::from_str(&content)?;
        debug!(
            max_frames = ?config.loop_config.max_frames,
            store_dir = %config.store.dir,
            approvals = ?config.approvals.mode,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Impossible values are errors; suspicious but workable values come back
    /// as warnings for the caller to display.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut warnings = Vec::new();
        let lc = &self.loop_config;

        if lc.max_frames == Some(0) {
            return Err(ConfigError::Invalid {
                field: "loop.max_frames".to_string(),
                message: "must be at least 1 when set".to_string(),
            });
        }

        if lc.initial_settle_ms == 0 {
            warnings.push(ConfigWarning::InvalidValue {
                field: "loop.initial_settle_ms".to_string(),
                message: "0 disables the startup debounce; the first dispatch may race completion"
                    .to_string(),
            });
        }

        if lc.trailing_settle_ms > lc.initial_settle_ms {
            warnings.push(ConfigWarning::InvalidValue {
                field: "loop.trailing_settle_ms".to_string(),
                message: format!(
                    "trailing window ({}ms) is longer than the initial window ({}ms)",
                    lc.trailing_settle_ms, lc.initial_settle_ms
                ),
            });
        }

        if self.retry.max_retries > 0 && self.retry.base_delay_ms == 0 {
            warnings.push(ConfigWarning::InvalidValue {
                field: "retry.base_delay_ms".to_string(),
                message: "retries will fire back-to-back with no delay".to_string(),
            });
        }

        for tag in &self.debug.event_filter {
            if smithers_proto::DebugEventKind::from_tag(tag).is_none() {
                warnings.push(ConfigWarning::UnknownEventTag { tag: tag.clone() });
            }
        }

        if !self.debug.enabled && self.debug.jsonl_path.is_some() {
            warnings.push(ConfigWarning::InvalidValue {
                field: "debug.jsonl_path".to_string(),
                message: "ignored because debug.enabled is false".to_string(),
            });
        }

        Ok(warnings)
    }
}

/// Configuration warnings emitted during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Field has a value that works but is probably a mistake.
    InvalidValue { field: String, message: String },
    /// `debug.event_filter` names a tag no event carries.
    UnknownEventTag { tag: String },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::InvalidValue { field, message } => {
                write!(f, "Warning [{}]: {}", field, message)
            }
            ConfigWarning::UnknownEventTag { tag } => {
                write!(f, "Warning [debug.event_filter]: unknown event tag '{}'", tag)
            }
        }
    }
}

/// Frame driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Hard cap on frames. `None` means unbounded.
    #[serde(default)]
    pub max_frames: Option<u32>,

    /// Wall-clock budget for the whole run.
    #[serde(default)]
    pub global_timeout_ms: Option<u64>,

    /// Budget on the sum of `tokens_used` across all executor calls.
    #[serde(default)]
    pub max_total_tokens: Option<u64>,

    /// Debounce before declaring completion when no task has ever started.
    #[serde(default = "default_initial_settle_ms")]
    pub initial_settle_ms: u64,

    /// Debounce before declaring completion after work has run.
    #[serde(default = "default_trailing_settle_ms")]
    pub trailing_settle_ms: u64,

    /// Minimum gap between consecutive frame starts.
    #[serde(default)]
    pub min_frame_interval_ms: u64,
}

fn default_initial_settle_ms() -> u64 {
    500
}

fn default_trailing_settle_ms() -> u64 {
    100
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_frames: None,
            global_timeout_ms: None,
            max_total_tokens: None,
            initial_settle_ms: default_initial_settle_ms(),
            trailing_settle_ms: default_trailing_settle_ms(),
            min_frame_interval_ms: 0,
        }
    }
}

impl LoopConfig {
    pub fn initial_settle(&self) -> Duration {
        Duration::from_millis(self.initial_settle_ms)
    }

    pub fn trailing_settle(&self) -> Duration {
        Duration::from_millis(self.trailing_settle_ms)
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout_ms.map(Duration::from_millis)
    }

    pub fn min_frame_interval(&self) -> Duration {
        Duration::from_millis(self.min_frame_interval_ms)
    }
}

/// Debug event bus configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Tags to emit (e.g. `node:found`). Empty means all tags.
    #[serde(default)]
    pub event_filter: Vec<String>,

    /// Append debug events as JSON lines to this file.
    #[serde(default)]
    pub jsonl_path: Option<String>,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding one journal per execution id.
    #[serde(default = "default_store_dir")]
    pub dir: String,

    /// When false the store stays in memory and nothing survives the process.
    #[serde(default = "default_true")]
    pub persist: bool,
}

fn default_store_dir() -> String {
    ".smithers".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            persist: true,
        }
    }
}

impl StoreConfig {
    /// Journal path for an execution id.
    pub fn journal_path(&self, execution_id: &str) -> PathBuf {
        Path::new(&self.dir).join(format!("{execution_id}.jsonl"))
    }
}

/// How human gates are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Approve every gate immediately.
    #[default]
    Auto,
    /// Wait for an explicit `/approve` or `/reject`.
    Manual,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub mode: ApprovalMode,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for '{field}': {message}")]
    Invalid { field: String, message: String },
}
