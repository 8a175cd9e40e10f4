//! Configuration
//!
//! TOML-based configuration for the broker core, following the recognized
//! options laid out for the protocol layer: duplicate-delivery suppression,
//! QoS-0 queueing to disconnected clients, per-client flow-control limits,
//! and the restore-on-open persistence hook.

use std::path::PathBuf;

use serde::Deserialize;


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Per-client flow-control limits
    pub limits: LimitsConfig,
    /// Delivery behavior knobs
    pub behavior: BehaviorConfig,
    /// Restore-on-open persistence
    pub persistence: PersistenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Per-client flow-control limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent unacked Out deliveries per client (0 = unbounded).
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Maximum `Queued` backlog per client (0 = unbounded).
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
}

fn default_max_inflight() -> usize {
    20
}

fn default_max_queued() -> usize {
    100
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            max_queued: default_max_queued(),
        }
    }
}

/// Delivery behavior knobs
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Enables the `dest_ids` dedup set so overlapping subscriptions don't
    /// double-deliver a publish to the same client.
    pub allow_duplicate_messages: bool,
    /// Queue QoS-0 publishes to disconnected clients instead of dropping them.
    pub queue_qos0_messages: bool,
}

/// Restore-on-open persistence configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Enables the restore-on-open hook (`BrokerDatabase::open`'s `restore` argument).
    pub enabled: bool,
    /// Path the external persistence backend reads/writes. Required if `enabled`.
    pub filepath: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.persistence.enabled && self.persistence.filepath.is_none() {
            return Err(ConfigError::Validation(
                "persistence.filepath is required when persistence.enabled is true".to_string(),
            ));
        }
        Ok(())
    }
}
