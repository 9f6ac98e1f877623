//! Configuration loading for the sync engine.
//!
//! Configuration is loaded from a TOML file. Every section and field is
//! optional and falls back to its default.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tablesync_core::{BackoffPolicy, ConnectorPolicy};

/// Root configuration for the sync engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Local storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Batched sync configuration.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Remote call configuration.
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Live channel configuration.
    #[serde(default)]
    pub live: LiveConfig,
    /// Reconnect backoff configuration.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Local storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file (default: tablesync.db).
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

/// Batched sync configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Entries per download page and upload batch (default: 500).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Hold tables in live mode after a resync (default: false).
    #[serde(default)]
    pub live_by_default: bool,
    /// Capacity of the local change-notice queue (default: 1024).
    #[serde(default = "default_change_queue_capacity")]
    pub change_queue_capacity: usize,
}

/// Remote call configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Deadline for every remote call in milliseconds (default: 30000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Live channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    /// Consecutive invalid pushes tolerated before disabling (default: 5).
    #[serde(default = "default_invalid_data_threshold")]
    pub invalid_data_threshold: u32,
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// First reconnect delay in milliseconds (default: 5000).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Delay cap in milliseconds (default: 600000 = 10 minutes).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Reconnect attempts before giving up (default: 8).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Random jitter bound in milliseconds (default: 1000).
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("tablesync.db")
}

fn default_batch_size() -> usize {
    500
}

fn default_change_queue_capacity() -> usize {
    1024
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_invalid_data_threshold() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_max_attempts() -> u32 {
    8
}

fn default_jitter_ms() -> u64 {
    1_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            live_by_default: false,
            change_queue_capacity: default_change_queue_capacity(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            invalid_data_threshold: default_invalid_data_threshold(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.sync.batch_size == 0 {
            return invalid("sync.batch_size must be positive");
        }
        if self.sync.change_queue_capacity == 0 {
            return invalid("sync.change_queue_capacity must be positive");
        }
        if self.remote.request_timeout_ms == 0 {
            return invalid("remote.request_timeout_ms must be positive");
        }
        if self.live.invalid_data_threshold == 0 {
            return invalid("live.invalid_data_threshold must be positive");
        }
        if self.backoff.initial_delay_ms == 0 || self.backoff.max_attempts == 0 {
            return invalid("backoff.initial_delay_ms and backoff.max_attempts must be positive");
        }
        if self.backoff.max_delay_ms < self.backoff.initial_delay_ms {
            return invalid("backoff.max_delay_ms must not be below backoff.initial_delay_ms");
        }
        // Jitter at or above the first delay could make delays shrink
        if self.backoff.jitter_ms >= self.backoff.initial_delay_ms {
            return invalid("backoff.jitter_ms must be below backoff.initial_delay_ms");
        }
        Ok(())
    }

    /// Deadline for one remote call.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.request_timeout_ms)
    }

    /// Live-channel policy derived from the `[live]` and `[backoff]` sections.
    pub fn connector_policy(&self) -> ConnectorPolicy {
        ConnectorPolicy {
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.backoff.initial_delay_ms),
                Duration::from_millis(self.backoff.max_delay_ms),
                self.backoff.max_attempts,
            )
            .with_jitter(Duration::from_millis(self.backoff.jitter_ms)),
            invalid_data_threshold: self.live.invalid_data_threshold,
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sync.batch_size, 500);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.live.invalid_data_threshold, 5);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[storage]
database = "/data/app.db"

[sync]
batch_size = 50
live_by_default = true

[remote]
request_timeout_ms = 2000

[live]
invalid_data_threshold = 3

[backoff]
initial_delay_ms = 100
max_delay_ms = 1000
max_attempts = 4
jitter_ms = 10
"#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.database, PathBuf::from("/data/app.db"));
        assert_eq!(config.sync.batch_size, 50);
        assert!(config.sync.live_by_default);
        assert_eq!(config.sync.change_queue_capacity, 1024);

        let policy = config.connector_policy();
        assert_eq!(policy.invalid_data_threshold, 3);
        assert_eq!(policy.backoff.max_attempts, 4);
        assert_eq!(policy.backoff.jitter, Duration::from_millis(10));
    }

    #[test]
    fn config_missing_sections_use_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.backoff.initial_delay_ms, 5_000);
        assert_eq!(config.storage.database, PathBuf::from("tablesync.db"));
    }

    #[test]
    fn jitter_must_stay_below_initial_delay() {
        let mut config = EngineConfig::default();
        config.backoff.jitter_ms = config.backoff.initial_delay_ms;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let mut config = EngineConfig::default();
        config.sync.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.sync.change_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reports_read_and_parse_errors() {
        let missing = EngineConfig::from_file(std::path::Path::new("/nonexistent/tablesync.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\nbatch_size = \"many\"").unwrap();
        assert!(matches!(
            EngineConfig::from_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
