//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::LimitConfig;

/// Environment variable prefix for overrides, e.g. `TOLLGATE__LIMITS__CAPACITY`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for a Tollgate deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Durable store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Default limit applied to identities without an override
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the file store
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Namespace prefix for this limiter's records
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            prefix: default_prefix(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("tollgate-store.json")
}

fn default_prefix() -> String {
    "tollgate".to_string()
}

/// Default limit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Refill interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Bucket capacity in tokens
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Tokens added per interval
    #[serde(default = "default_quantum")]
    pub quantum: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            capacity: default_capacity(),
            quantum: default_quantum(),
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_capacity() -> u64 {
    10
}

fn default_quantum() -> u64 {
    1
}

impl LimitsConfig {
    /// Convert to a validated [`LimitConfig`].
    pub fn to_limit_config(&self) -> Result<LimitConfig> {
        let config = LimitConfig::new(
            Duration::from_millis(self.interval_ms),
            self.capacity,
            self.quantum,
        );
        config.validate()?;
        Ok(config)
    }
}

impl TollgateConfig {
    /// Load configuration from a file, with `TOLLGATE__*` environment
    /// variables taking precedence over file values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "Loading configuration");

        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
