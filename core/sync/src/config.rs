//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use driftwood_common::{Error, Result};

use crate::detector::DEFAULT_IGNORED_FIELDS;
use crate::resolver::ConflictPolicy;
use crate::retry::RetryConfig;
use crate::scheduler::SyncMode;

/// Longest accepted queue retention (ten years).
pub const MAX_RETENTION: Duration = Duration::from_secs(10 * 365 * 86_400);

/// Configuration for the sync engine.
///
/// Durations are written as milliseconds in JSON. Missing keys take their
/// default, so a config file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Retries of a transient remote failure within one run.
    pub max_retries: u32,
    /// First backoff delay between retries.
    #[serde(with = "millis")]
    pub retry_initial_delay: Duration,
    /// Upper bound for any single remote call.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// When the scheduler triggers runs on its own.
    pub sync_mode: SyncMode,
    /// Quiet period after regaining connectivity before a run starts.
    #[serde(with = "millis")]
    pub connectivity_debounce: Duration,
    /// Automatic conflict handling.
    pub conflict_policy: ConflictPolicy,
    /// Passes one run may make when new work shows up mid-run.
    pub max_passes: u32,
    /// Payload fields the conflict detector never compares.
    pub ignored_fields: Vec<String>,
    /// How long acknowledged queue items are kept. `None` keeps them forever.
    #[serde(with = "millis::option")]
    pub retention: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_initial_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
            sync_mode: SyncMode::Manual,
            connectivity_debounce: Duration::from_secs(1),
            conflict_policy: ConflictPolicy::Manual,
            max_passes: 3,
            ignored_fields: DEFAULT_IGNORED_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            retention: None,
        }
    }
}

impl SyncConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_passes == 0 {
            return Err(Error::InvalidInput(
                "max_passes must be at least 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "request_timeout must be positive".to_string(),
            ));
        }
        if let Some(retention) = self.retention {
            if retention > MAX_RETENTION {
                return Err(Error::InvalidInput(format!(
                    "retention must not exceed {} days",
                    MAX_RETENTION.as_secs() / 86_400
                )));
            }
        }
        if let SyncMode::Periodic { interval } = &self.sync_mode {
            if interval.is_zero() {
                return Err(Error::InvalidInput(
                    "periodic interval must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Retry settings for remote calls.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(self.retry_initial_delay)
            .with_request_timeout(self.request_timeout)
    }
}

/// Serde helpers writing `Duration` as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
