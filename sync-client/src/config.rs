//! Configuration loading for the sync engine.
//!
//! Configuration is loaded from a TOML file; every field has a default so an
//! empty file (or [`SyncConfig::default`]) is valid.

use convsync_core::{BackoffPolicy, ConnectionPolicy};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Version of the slow sync procedure.
///
/// Bumped when the steps change in a way that requires every client to
/// re-run slow sync.
pub const SLOW_SYNC_VERSION: u32 = 1;

/// Root configuration for the sync engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    /// Retry pacing.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Slow sync configuration.
    #[serde(default)]
    pub slow_sync: SlowSyncConfig,
    /// Incremental sync configuration.
    #[serde(default)]
    pub incremental: IncrementalSyncConfig,
}

/// Retry pacing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// Delay of the first retry in milliseconds (default: 1000).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Cap of the base delay in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per attempt (default: 2).
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Upper bound of random jitter in milliseconds (default: 0).
    #[serde(default)]
    pub max_jitter_ms: u64,
}

/// Slow sync configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SlowSyncConfig {
    /// Current slow sync version; older completed syncs are re-run.
    #[serde(default = "default_slow_sync_version")]
    pub version: u32,
    /// Re-run a completed slow sync older than this many seconds.
    /// Unset means never.
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

/// Incremental sync configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncrementalSyncConfig {
    /// Initial connection policy (default: keep_alive).
    #[serde(default)]
    pub connection_policy: ConnectionPolicy,
}

// Default value functions
fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> u32 {
    2
}

fn default_slow_sync_version() -> u32 {
    SLOW_SYNC_VERSION
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_jitter_ms: 0,
        }
    }
}

impl Default for SlowSyncConfig {
    fn default() -> Self {
        Self {
            version: default_slow_sync_version(),
            max_age_secs: None,
        }
    }
}

impl BackoffConfig {
    /// The backoff policy described by this section.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.initial_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            max_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }
}

impl SlowSyncConfig {
    /// Maximum age of a completed slow sync.
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            source: e,
        })
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
}
