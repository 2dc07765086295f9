use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Worker pool settings for the delayed queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum reminder executions running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Retry budget for retryable payload failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total dispatch attempts per firing, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further attempt.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Ceiling for the backoff delay.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_secs() -> u64 {
    30
}

fn default_max_delay_secs() -> u64 {
    30 * 60
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// What reconciliation does with reminders that became due while nothing was running.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverduePolicy {
    /// Leave them alone; they never fire.
    Skip,
    /// Fire them as soon as possible.
    #[default]
    FireNow,
    /// Recurring reminders roll forward to their next future occurrence;
    /// one-time reminders fire as soon as possible.
    Advance,
}

/// Store/queue reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub overdue_policy: OverduePolicy,
    /// Seconds between reconciliation sweeps while serving. `0` runs it only at start-up.
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
}

fn default_reconcile_interval() -> u64 {
    30
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            overdue_policy: OverduePolicy::default(),
            interval_secs: default_reconcile_interval(),
        }
    }
}

/// HTTP agent backend used for `ai_agent` reminders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Endpoint receiving agent task requests. `ai_agent` reminders fail terminally when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Per-request timeout.
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

fn default_api_key_env() -> String {
    "NUDGE_AGENT_API_KEY".to_string()
}

fn default_agent_timeout() -> u64 {
    120
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_agent_timeout(),
        }
    }
}

/// Top-level nudge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NudgeConfig {
    /// SQLite database path. Defaults to `~/.nudge/nudge.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl NudgeConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("nudge.db")),
        }
    }
}

/// Resolve the nudge config directory (~/.nudge/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".nudge"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.nudge/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<NudgeConfig, ConfigError> {
    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
///
/// Variables from a `.env` file in the working directory are loaded first so
/// secrets such as the agent API key resolve whichever path is used.
pub fn load_config_from(path: &Path) -> Result<NudgeConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(NudgeConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: NudgeConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the directory holding `path` exists.
pub fn ensure_parent_dir(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
