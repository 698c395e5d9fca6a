//! Engine settings.
//!
//! Every tunable constant of the engine lives here. Defaults match production
//! behaviour; `from_env` lets a host override individual values without a
//! config file.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Tunables for capture, bulk operations and retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverabilitySettings {
    /// Number of messages per archive/unarchive batch.
    pub batch_size: usize,
    /// Processing attempts retained per failed message.
    pub max_processing_attempts: usize,
    /// How long finalization waits for the store index to catch up.
    pub finalize_timeout: Duration,
    /// Poll interval while waiting for index consistency.
    pub consistency_poll_interval: Duration,
    /// Silence after which a retry run without an expected count stops.
    pub retry_idle_timeout: Duration,
    /// Staged messages handled concurrently by the forwarder.
    pub retry_concurrency: usize,
    /// Minimum spacing between progress events of one operation.
    pub progress_publish_interval: Duration,
    /// Optimistic-concurrency retries for a failed-message merge.
    pub max_upsert_retries: usize,
    /// Logical address of the retry staging queue.
    pub staging_queue: String,
}

impl Default for RecoverabilitySettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_processing_attempts: recoverability_failures::DEFAULT_MAX_PROCESSING_ATTEMPTS,
            finalize_timeout: Duration::from_secs(5 * 60),
            consistency_poll_interval: Duration::from_millis(500),
            retry_idle_timeout: Duration::from_secs(45),
            retry_concurrency: 4,
            progress_publish_interval: Duration::from_secs(1),
            max_upsert_retries: 5,
            staging_queue: "recoverability.staging".to_string(),
        }
    }
}

impl RecoverabilitySettings {
    /// Defaults overridden by `RECOVERABILITY_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] but reading from an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Self::default();

        override_with(&lookup, "RECOVERABILITY_BATCH_SIZE", &mut s.batch_size);
        override_with(
            &lookup,
            "RECOVERABILITY_MAX_PROCESSING_ATTEMPTS",
            &mut s.max_processing_attempts,
        );
        override_with(&lookup, "RECOVERABILITY_RETRY_CONCURRENCY", &mut s.retry_concurrency);
        override_with(&lookup, "RECOVERABILITY_MAX_UPSERT_RETRIES", &mut s.max_upsert_retries);

        override_duration(&lookup, "RECOVERABILITY_FINALIZE_TIMEOUT_SECS", Duration::from_secs, &mut s.finalize_timeout);
        override_duration(&lookup, "RECOVERABILITY_CONSISTENCY_POLL_MS", Duration::from_millis, &mut s.consistency_poll_interval);
        override_duration(&lookup, "RECOVERABILITY_RETRY_IDLE_TIMEOUT_SECS", Duration::from_secs, &mut s.retry_idle_timeout);
        override_duration(&lookup, "RECOVERABILITY_PROGRESS_INTERVAL_MS", Duration::from_millis, &mut s.progress_publish_interval);

        if let Some(queue) = lookup("RECOVERABILITY_STAGING_QUEUE").filter(|q| !q.trim().is_empty()) {
            s.staging_queue = queue;
        }

        // Zero would make batching or forwarding impossible.
        if s.batch_size == 0 {
            warn!("RECOVERABILITY_BATCH_SIZE must be positive; using default");
            s.batch_size = Self::default().batch_size;
        }
        if s.retry_concurrency == 0 {
            warn!("RECOVERABILITY_RETRY_CONCURRENCY must be positive; using default");
            s.retry_concurrency = Self::default().retry_concurrency;
        }

        s
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry_idle_timeout(mut self, timeout: Duration) -> Self {
        self.retry_idle_timeout = timeout;
        self
    }

    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    pub fn with_consistency_poll_interval(mut self, interval: Duration) -> Self {
        self.consistency_poll_interval = interval;
        self
    }
}

fn override_with<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "ignoring malformed setting"),
        }
    }
}

fn override_duration<F>(lookup: &F, key: &str, unit: fn(u64) -> Duration, target: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<u64>() {
            Ok(value) => *target = unit(value),
            Err(_) => warn!(key, value = %raw, "ignoring malformed setting"),
        }
    }
}
