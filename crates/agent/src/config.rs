//! Agent configuration
//!
//! Read from an optional file named by `QOS_AGENT_CONFIG`, then from
//! `QOS_AGENT_*` environment variables (nested keys use `__`, e.g.
//! `QOS_AGENT_ENGINE__DROP_DETECTOR=rolling`).

use anyhow::{Context, Result};
use qos_core::QosConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "QOS_AGENT_CONFIG";

const ENV_PREFIX: &str = "QOS_AGENT";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name used in logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health, metrics and valves
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON lines file the usage snapshots are read from
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// Control cycle interval in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Where corrections are appended; logged only when unset
    #[serde(default)]
    pub corrections_path: Option<PathBuf>,

    /// Retries after a failed correction sink call
    #[serde(default = "default_max_sink_retries")]
    pub max_sink_retries: u32,

    /// Engine tuning passed to both pipelines
    #[serde(default)]
    pub engine: QosConfig,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("/var/run/qos-agent/snapshots.jsonl")
}

fn default_interval() -> u64 {
    5
}

fn default_max_sink_retries() -> u32 {
    3
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            snapshot_path: default_snapshot_path(),
            interval_secs: default_interval(),
            corrections_path: None,
            max_sink_retries: default_max_sink_retries(),
            engine: QosConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment and the optional config file
    pub fn load() -> Result<Self> {
        Self::load_from(std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
    }

    /// Load with an explicit file; environment variables still override it
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &path {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read agent configuration")?;

        config
            .try_deserialize()
            .context("Invalid agent configuration")
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}
