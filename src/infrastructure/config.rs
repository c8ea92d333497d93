//! Runtime configuration with hierarchical merging.

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid lock settings: {0}")]
    InvalidLockSettings(String),

    #[error("Invalid signature TTL: must be positive")]
    InvalidTtl,

    #[error("Configuration load failed: {0}")]
    LoadFailed(String),
}

/// Advisory-lock acquisition tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// Lease duration of a held lock; bounds damage from crashed holders.
    #[serde(default = "LockSettings::default_lease_ms")]
    pub lease_ms: u64,
    /// Initial backoff between acquisition retries.
    #[serde(default = "LockSettings::default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "LockSettings::default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Give up acquiring after this long and surface a conflict.
    #[serde(default = "LockSettings::default_retry_max_elapsed_ms")]
    pub retry_max_elapsed_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease_ms: Self::default_lease_ms(),
            retry_initial_ms: Self::default_retry_initial_ms(),
            retry_max_ms: Self::default_retry_max_ms(),
            retry_max_elapsed_ms: Self::default_retry_max_elapsed_ms(),
        }
    }
}

impl LockSettings {
    fn default_lease_ms() -> u64 {
        30_000
    }
    fn default_retry_initial_ms() -> u64 {
        10
    }
    fn default_retry_max_ms() -> u64 {
        500
    }
    fn default_retry_max_elapsed_ms() -> u64 {
        10_000
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "LogConfig::default_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LogConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Top-level mageflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Sliding TTL for signature records, refreshed on every mutation.
    #[serde(default = "FlowConfig::default_signature_ttl_seconds")]
    pub signature_ttl_seconds: u64,

    /// Defensive sleep after the invoker requests cancellation of an attempt,
    /// giving the executor time to act before the wrapper returns.
    #[serde(default = "FlowConfig::default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    #[serde(default)]
    pub lock: LockSettings,

    #[serde(default)]
    pub log: LogConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            signature_ttl_seconds: Self::default_signature_ttl_seconds(),
            cancel_grace_ms: Self::default_cancel_grace_ms(),
            lock: LockSettings::default(),
            log: LogConfig::default(),
        }
    }
}

impl FlowConfig {
    fn default_signature_ttl_seconds() -> u64 {
        24 * 60 * 60
    }

    fn default_cancel_grace_ms() -> u64 {
        10_000
    }

    pub fn signature_ttl(&self) -> Duration {
        Duration::from_secs(self.signature_ttl_seconds)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. mageflow.yaml in the working directory
    /// 3. Environment variables (MAGEFLOW_* prefix)
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::file("mageflow.yaml"))
            .merge(Env::prefixed("MAGEFLOW_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signature_ttl_seconds == 0 {
            return Err(ConfigError::InvalidTtl);
        }
        if !matches!(
            self.log.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }
        if self.lock.lease_ms == 0 {
            return Err(ConfigError::InvalidLockSettings(
                "lease_ms must be positive".to_string(),
            ));
        }
        if self.lock.retry_initial_ms > self.lock.retry_max_ms {
            return Err(ConfigError::InvalidLockSettings(format!(
                "retry_initial_ms ({}) must not exceed retry_max_ms ({})",
                self.lock.retry_initial_ms, self.lock.retry_max_ms
            )));
        }
        Ok(())
    }
}
