//! Sync engine and backend configuration.
//!
//! `SyncConfig` tunes the queue drain (retry budget, backoff schedule, batch
//! size, timers). `BackendConfig` locates the remote REST store. Both are
//! plain serde structs so the CLI can embed them in its config file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::MAX_ATTEMPTS;
use crate::queue::RetryPolicy;
use crate::util::{is_http_url, normalize_text_option};

/// Environment variable holding the REST base URL
pub const API_URL_ENV: &str = "REPS_API_URL";
/// Environment variable holding the REST API key
pub const API_KEY_ENV: &str = "REPS_API_KEY";

const DEFAULT_BACKOFF_SCHEDULE_MS: [u64; 5] = [1_000, 5_000, 30_000, 120_000, 600_000];

/// Tuning knobs for the sync manager and its background driver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// Apply attempts before an operation is moved to the failed records
    pub max_attempts: u32,
    /// Delay after the n-th failed attempt; the last entry repeats
    pub backoff_schedule_ms: Vec<u64>,
    /// Upper bound for a drained batch on a good connection
    pub batch_size: usize,
    pub debounce_ms: u64,
    /// Bound on a single backend apply call
    pub apply_timeout_ms: u64,
    pub auto_resolve_conflicts: bool,
    /// Periodic pass while online; `None` disables it
    pub auto_sync_interval_secs: Option<u64>,
    /// Record field compared by last-write-wins
    pub conflict_timestamp_field: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff_schedule_ms: DEFAULT_BACKOFF_SCHEDULE_MS.to_vec(),
            batch_size: 25,
            debounce_ms: 1_000,
            apply_timeout_ms: 15_000,
            auto_resolve_conflicts: true,
            auto_sync_interval_secs: Some(60),
            conflict_timestamp_field: "updated_at".to_string(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON document
    pub fn from_json(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)
            .map_err(|error| Error::Config(format!("invalid sync config JSON: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file; a missing file yields the defaults
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS {
            return Err(Error::Config(format!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS}"
            )));
        }
        if self.backoff_schedule_ms.is_empty() {
            return Err(Error::Config(
                "backoff_schedule_ms must not be empty".to_string(),
            ));
        }
        if self
            .backoff_schedule_ms
            .windows(2)
            .any(|pair| pair[1] < pair[0])
        {
            return Err(Error::Config(
                "backoff_schedule_ms must be non-decreasing".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".to_string()));
        }
        if self.apply_timeout_ms == 0 {
            return Err(Error::Config(
                "apply_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.auto_sync_interval_secs == Some(0) {
            return Err(Error::Config(
                "auto_sync_interval_secs must be greater than 0 when set".to_string(),
            ));
        }
        if self.conflict_timestamp_field.trim().is_empty() {
            return Err(Error::Config(
                "conflict_timestamp_field must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Attempt budget and backoff schedule for the queue
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(self)
    }

    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub const fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn auto_sync_interval(&self) -> Option<Duration> {
        self.auto_sync_interval_secs.map(Duration::from_secs)
    }
}

/// Location and credentials of the REST storage backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: String,
}

impl BackendConfig {
    /// Validate and normalize raw values
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .ok_or_else(|| Error::Config("backend base_url is required".to_string()))?;
        if !is_http_url(&base_url) {
            return Err(Error::Config(
                "backend base_url must include http:// or https://".to_string(),
            ));
        }
        let api_key = normalize_text_option(Some(api_key.into()))
            .ok_or_else(|| Error::Config("backend api_key is required".to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Read `REPS_API_URL` / `REPS_API_KEY`; `None` when either is unset
    pub fn from_env() -> Result<Option<Self>> {
        let base_url = normalize_text_option(std::env::var(API_URL_ENV).ok());
        let api_key = normalize_text_option(std::env::var(API_KEY_ENV).ok());
        match (base_url, api_key) {
            (Some(base_url), Some(api_key)) => Self::new(base_url, api_key).map(Some),
            (None, None) => Ok(None),
            _ => Err(Error::Config(format!(
                "both {API_URL_ENV} and {API_KEY_ENV} must be set"
            ))),
        }
    }

    /// Re-run normalization on a deserialized value
    pub fn normalized(self) -> Result<Self> {
        Self::new(self.base_url, self.api_key)
    }
}
