use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const MIN_PROBE_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("configuration could not be parsed: {0}")]
    Parse(String),
}

/// What the driver does with an action the remote side refuses permanently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermanentFailurePolicy {
    /// Move it to the dead-letter list and keep draining.
    #[default]
    DeadLetter,
    /// Treat it like any transient failure; the queue stays blocked on it.
    RetryForever,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_entries: usize,
    pub probe_interval_ms: u64,
    pub alert_after_attempts: u32,
    pub permanent_failure_policy: PermanentFailurePolicy,
    pub removed_id_cache_size: usize,
    pub event_channel_capacity: usize,
    pub assume_reachable_at_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            probe_interval_ms: 5_000,
            alert_after_attempts: 5,
            permanent_failure_policy: PermanentFailurePolicy::DeadLetter,
            removed_id_cache_size: 10_000,
            event_channel_capacity: 256,
            assume_reachable_at_start: true,
        }
    }
}

impl SyncConfig {
    /// Parses a JSON document; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::Validation("max_entries must be > 0".into()));
        }
        if self.probe_interval_ms < MIN_PROBE_INTERVAL_MS {
            return Err(ConfigError::Validation(format!(
                "probe_interval_ms should be at least {}ms",
                MIN_PROBE_INTERVAL_MS
            )));
        }
        if self.alert_after_attempts == 0 {
            return Err(ConfigError::Validation(
                "alert_after_attempts must be > 0".into(),
            ));
        }
        if self.removed_id_cache_size == 0 {
            return Err(ConfigError::Validation(
                "removed_id_cache_size must be > 0".into(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "event_channel_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}
