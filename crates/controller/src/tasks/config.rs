//! Controller Configuration
//!
//! Process-wide settings loaded from a mounted YAML file. Every section and
//! field has a default, so a partial file (or none at all) is valid.

use crate::remediation::persistence::PersistSettings;
use crate::remediation::retry::RetryPolicy;
use crate::remediation::status::StatusLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default mounted config location
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Environment variable overriding the config location
pub const CONFIG_PATH_ENV: &str = "CONTROLLER_CONFIG_PATH";

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    pub watch: WatchConfig,
    pub dispatch: DispatchConfig,
    pub persistence: PersistenceConfig,
    pub status: StatusConfig,
    pub dedup: DedupConfig,
}

/// Event watch configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchConfig {
    /// Namespace to watch; all namespaces when unset
    pub namespace: Option<String>,

    /// Events processed concurrently
    pub concurrency: usize,

    /// Events last observed longer ago than this are skipped (0 disables)
    pub max_event_age_seconds: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            concurrency: 16,
            max_event_age_seconds: 3600,
        }
    }
}

impl WatchConfig {
    #[must_use]
    pub fn max_event_age(&self) -> Option<chrono::Duration> {
        (self.max_event_age_seconds > 0)
            .then(|| chrono::Duration::seconds(i64::try_from(self.max_event_age_seconds).unwrap_or(i64::MAX)))
    }
}

/// Remediation backend call configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchConfig {
    /// Per-attempt timeout
    pub request_timeout_seconds: u64,
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Retry configuration for backend calls
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_millis: u64,
    pub max_delay_millis: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_millis: 500,
            max_delay_millis: 30_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_millis),
            max_delay: Duration::from_millis(self.max_delay_millis),
            jitter: self.jitter,
        }
    }
}

/// Cooldown snapshot persistence configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceConfig {
    pub sync_interval_seconds: u64,
    pub min_persist_interval_seconds: u64,
    /// Must stay well below the 1 MiB ConfigMap ceiling
    pub max_snapshot_bytes: usize,
    pub too_large_backoff_seconds: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            sync_interval_seconds: 30,
            min_persist_interval_seconds: 60,
            max_snapshot_bytes: 512 * 1024,
            too_large_backoff_seconds: 300,
            shutdown_timeout_seconds: 5,
        }
    }
}

impl PersistenceConfig {
    #[must_use]
    pub fn settings(&self) -> PersistSettings {
        let seconds = |s: u64| chrono::Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX));
        PersistSettings {
            sync_interval: Duration::from_secs(self.sync_interval_seconds),
            min_persist_interval: seconds(self.min_persist_interval_seconds),
            max_snapshot_bytes: self.max_snapshot_bytes,
            too_large_backoff: seconds(self.too_large_backoff_seconds),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }
}

/// Policy status write configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusConfig {
    pub counter_ceiling: u64,
    pub last_error_bytes: usize,
    pub conflict_retries: u32,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            counter_ceiling: 100_000,
            last_error_bytes: 1024,
            conflict_retries: 5,
        }
    }
}

impl StatusConfig {
    #[must_use]
    pub fn limits(&self) -> StatusLimits {
        StatusLimits {
            counter_ceiling: self.counter_ceiling,
            last_error_bytes: self.last_error_bytes,
        }
    }
}

/// Duplicate event suppression configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DedupConfig {
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 600,
            max_entries: 10_000,
        }
    }
}

impl DedupConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl ControllerConfig {
    /// Check that all required configuration values are present and sane
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.watch.concurrency == 0 {
            return Err(anyhow::anyhow!("watch.concurrency must be at least 1"));
        }
        if self.dispatch.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("dispatch.requestTimeoutSeconds must be at least 1"));
        }
        if self.dispatch.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("dispatch.retry.maxAttempts must be at least 1"));
        }
        if self.dispatch.retry.base_delay_millis > self.dispatch.retry.max_delay_millis {
            return Err(anyhow::anyhow!(
                "dispatch.retry.baseDelayMillis ({}) exceeds maxDelayMillis ({})",
                self.dispatch.retry.base_delay_millis,
                self.dispatch.retry.max_delay_millis
            ));
        }
        if self.persistence.sync_interval_seconds == 0 {
            return Err(anyhow::anyhow!("persistence.syncIntervalSeconds must be at least 1"));
        }
        // ConfigMaps are capped at 1 MiB including metadata
        if self.persistence.max_snapshot_bytes == 0 || self.persistence.max_snapshot_bytes > 1_000_000 {
            return Err(anyhow::anyhow!(
                "persistence.maxSnapshotBytes must be between 1 and 1000000, got {}",
                self.persistence.max_snapshot_bytes
            ));
        }
        if self.status.conflict_retries == 0 {
            return Err(anyhow::anyhow!("status.conflictRetries must be at least 1"));
        }
        if self.dedup.max_entries == 0 {
            return Err(anyhow::anyhow!("dedup.maxEntries must be at least 1"));
        }
        Ok(())
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(yaml).map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Config path from `CONTROLLER_CONFIG_PATH`, else the default mount
    #[must_use]
    pub fn default_path() -> String {
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }
}
