//! Agent configuration

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Group id of this agent.
    #[serde(default)]
    pub gid: u32,

    /// Node id of this agent.
    #[serde(default)]
    pub nid: u32,

    /// Roles advertised on every command poll.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Controllers by key; each poller and sink binds to one entry.
    #[serde(default)]
    pub controllers: HashMap<String, ControllerConfig>,

    /// Optional subset of controller keys to poll; empty polls all.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Worker pool size for the unnamed command substrate.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    /// Default stats cadence stamped onto commands, seconds.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Minimum spacing between reconnect attempts, seconds.
    #[serde(default = "default_reconnect_sleep")]
    pub reconnect_sleep_secs: u64,

    /// Idle lifetime of an empty named queue, seconds.
    #[serde(default = "default_queue_idle_grace")]
    pub queue_idle_grace_secs: u64,

    /// Shutdown drain window before runners are killed, seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Aggregator flush cadence, seconds.
    #[serde(default = "default_metrics_flush")]
    pub metrics_flush_secs: u64,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub containers: ContainersConfig,
}

/// One remote controller endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Base url, e.g. `http://controller:8966`.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Console logger level filter; empty accepts everything.
    #[serde(default)]
    pub console_levels: Vec<i64>,

    /// Controller batch logger level filter; empty accepts everything.
    #[serde(default)]
    pub batch_levels: Vec<i64>,

    /// Messages per log batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Periodic flush of partial log batches, seconds.
    #[serde(default = "default_batch_flush")]
    pub batch_flush_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console_levels: Vec::new(),
            batch_levels: Vec::new(),
            batch_size: default_batch_size(),
            batch_flush_secs: default_batch_flush(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainersConfig {
    /// Container process binary, launched once per created container.
    #[serde(default = "default_container_binary")]
    pub binary: PathBuf,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            binary: default_container_binary(),
        }
    }
}

fn default_max_jobs() -> usize {
    100
}

fn default_stats_interval() -> u64 {
    60
}

fn default_reconnect_sleep() -> u64 {
    4
}

fn default_queue_idle_grace() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_metrics_flush() -> u64 {
    300
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_flush() -> u64 {
    10
}

fn default_container_binary() -> PathBuf {
    PathBuf::from("coreX")
}

impl AgentConfig {
    /// Load configuration from the given file plus `AGENT_`-prefixed
    /// environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("AGENT").separator("__"))
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("config has invalid structure")?;

        if config.controllers.is_empty() {
            anyhow::bail!("config names no controllers");
        }
        for key in &config.channels {
            if !config.controllers.contains_key(key) {
                anyhow::bail!("channel '{key}' names no configured controller");
            }
        }

        Ok(config)
    }
}
