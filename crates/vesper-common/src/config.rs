//! Configuration types for Vesper

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::time::TimestampResolution;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VesperConfig {
    /// Human-readable name of this node, used in log output
    pub node_name: String,

    /// Storage backend configuration
    pub storage: StorageConfig,

    /// Transaction and locking configuration
    pub transaction: TransactionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for VesperConfig {
    fn default() -> Self {
        Self {
            node_name: "vesper-0".to_string(),
            storage: StorageConfig::default(),
            transaction: TransactionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl VesperConfig {
    /// Validate the configuration and return any errors.
    /// Fatal errors are returned as `Err(Vec<String>)`.
    /// Warnings are logged but do not cause failure.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node_name.trim().is_empty() {
            errors.push("node_name must not be empty".to_string());
        }

        if let Err(storage_errors) = self.storage.validate() {
            errors.extend(storage_errors);
        }
        if let Err(txn_errors) = self.transaction.validate() {
            errors.extend(txn_errors);
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            errors.push(format!(
                "logging.format must be \"text\" or \"json\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Backend families that can be named in `storage.backend`.
pub const BACKENDS: &[&str] = &["inmemory"];

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend family, one of [`BACKENDS`]
    pub backend: String,

    /// Suffix appended to a store name to form its lock store name
    #[serde(default = "default_lock_store_suffix")]
    pub lock_store_suffix: String,

    /// Store holding the persisted configuration namespace
    #[serde(default = "default_system_store")]
    pub system_store: String,
}

fn default_lock_store_suffix() -> String {
    "_lock_".to_string()
}

fn default_system_store() -> String {
    "system_properties".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "inmemory".to_string(),
            lock_store_suffix: default_lock_store_suffix(),
            system_store: default_system_store(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if !BACKENDS.contains(&self.backend.as_str()) {
            errors.push(format!(
                "storage.backend must be one of {:?}, got {:?}",
                BACKENDS, self.backend
            ));
        }
        if self.system_store.is_empty() {
            errors.push("storage.system_store must not be empty".to_string());
        }
        if self.lock_store_suffix.is_empty() {
            errors.push("storage.lock_store_suffix must not be empty".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn lock_store_name(&self, store: &str) -> String {
        format!("{}{}", store, self.lock_store_suffix)
    }
}

/// Transaction and locking configuration.
///
/// Immutable once handed to a transaction provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Resolution of the timestamp provider
    #[serde(default)]
    pub timestamp_resolution: TimestampResolution,

    /// How long a lock claim stays valid after it is written
    #[serde(default = "default_lock_expiration", with = "humantime_serde")]
    pub lock_expiration: Duration,

    /// Settle delay: wait between writing a claim and reading it back
    #[serde(default = "default_lock_wait", with = "humantime_serde")]
    pub lock_wait: Duration,

    /// Attempts at writing a single claim on transient backend failures
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,

    /// Retry policy for flushes and other backend operations
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_lock_expiration() -> Duration {
    Duration::from_secs(300)
}

fn default_lock_wait() -> Duration {
    Duration::from_millis(100)
}

fn default_lock_retries() -> u32 {
    3
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timestamp_resolution: TimestampResolution::default(),
            lock_expiration: default_lock_expiration(),
            lock_wait: default_lock_wait(),
            lock_retries: default_lock_retries(),
            retry: RetryConfig::default(),
        }
    }
}

impl TransactionConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.lock_expiration.is_zero() {
            errors.push("transaction.lock_expiration must be > 0".to_string());
        }
        // A claim must outlive its own verification.
        if self.lock_wait >= self.lock_expiration {
            errors.push(format!(
                "transaction.lock_wait ({:?}) must be shorter than lock_expiration ({:?})",
                self.lock_wait, self.lock_expiration
            ));
        }
        if self.lock_retries == 0 {
            errors.push("transaction.lock_retries must be > 0".to_string());
        }
        if let Err(retry_errors) = self.retry.validate() {
            errors.extend(retry_errors);
        }

        if self.lock_wait < Duration::from_millis(10) {
            tracing::warn!(
                "transaction.lock_wait of {:?} leaves little room for backend replication lag",
                self.lock_wait
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Exponential backoff policy for temporary backend failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Factor applied to the delay after each retry
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.max_backoff < self.initial_backoff {
            errors.push(format!(
                "retry.max_backoff ({:?}) must be >= initial_backoff ({:?})",
                self.max_backoff, self.initial_backoff
            ));
        }
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            errors.push(format!(
                "retry.backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(64) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exp);
        let nanos = self.initial_backoff.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max_backoff.as_nanos() as f64 {
            self.max_backoff
        } else {
            Duration::from_nanos(nanos.round() as u64)
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format (json or text)
    pub format: String,

    /// Log file path (None for stdout)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

/// Duration serialization helper
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
