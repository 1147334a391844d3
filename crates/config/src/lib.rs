//! Configuration schema and loader for datsync nodes.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the HTTP peer server listens on.
    pub listen: SocketAddr,

    /// Path prefix the peer protocol is served under.
    #[serde(default = "default_node_path")]
    pub node_path: String,

    /// Synchronization settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Initial peers (`host:port/path`).
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Retention window of the recent index in seconds. `<= 0` disables pruning.
    #[serde(default = "default_month_secs")]
    pub recent_range_secs: i64,

    /// Window used to bound `/head` probes in seconds. `0` asks for everything.
    #[serde(default = "default_month_secs")]
    pub get_range_secs: i64,

    /// Window of a non-full `/recent` refresh in seconds.
    #[serde(default = "default_update_range_secs")]
    pub update_range_secs: i64,

    /// Maximum number of peers contacted per fan-out.
    #[serde(default = "default_search_depth")]
    pub search_depth: usize,

    /// Per-request transport timeout in milliseconds.
    #[serde(default = "default_talk_timeout_ms")]
    pub talk_timeout_ms: u64,

    /// Interval of the periodic refresh + sync loop in seconds.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Suggested tags kept per datfile.
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,

    /// Datfiles always followed.
    #[serde(default)]
    pub threads: Vec<String>,

    /// Also follow every datfile the recent index learns about.
    #[serde(default = "default_follow_recent")]
    pub follow_recent: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            recent_range_secs: default_month_secs(),
            get_range_secs: default_month_secs(),
            update_range_secs: default_update_range_secs(),
            search_depth: default_search_depth(),
            talk_timeout_ms: default_talk_timeout_ms(),
            sync_interval_secs: default_sync_interval_secs(),
            max_tags: default_max_tags(),
            threads: Vec::new(),
            follow_recent: default_follow_recent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the WAL.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
        }
    }
}

// --- Defaults ---

fn default_node_path() -> String {
    "/server.cgi".to_string()
}
fn default_month_secs() -> i64 {
    31 * 24 * 60 * 60
}
fn default_update_range_secs() -> i64 {
    24 * 60 * 60
}
fn default_search_depth() -> usize {
    100
}
fn default_talk_timeout_ms() -> u64 {
    10_000
}
fn default_sync_interval_secs() -> u64 {
    3600
}
fn default_max_tags() -> usize {
    20
}
fn default_follow_recent() -> bool {
    true
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.node_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "node_path ({}) must start with '/'",
                self.node_path
            )));
        }
        if self.sync.search_depth == 0 {
            return Err(ConfigError::Invalid("sync.search_depth must be > 0".into()));
        }
        if self.sync.talk_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.talk_timeout_ms must be > 0".into(),
            ));
        }
        if self.sync.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.sync_interval_secs must be > 0".into(),
            ));
        }
        if self.sync.get_range_secs < 0 || self.sync.update_range_secs < 0 {
            return Err(ConfigError::Invalid(
                "sync.get_range_secs and sync.update_range_secs must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
