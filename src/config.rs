//! Configuration for the store and its write scheduler.

use std::env;
use std::time::Duration;

/// Tuning knobs for the mutation scheduler.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Quiet window for debounced (free-text) edits before dispatch.
    pub debounce_interval: Duration,
    /// Base delay for transient-failure retries; doubles per attempt.
    pub retry_backoff: Duration,
    /// Total write attempts (first try included) before a transient
    /// failure is surfaced to the record.
    pub max_write_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            debounce_interval: Duration::from_millis(300),
            retry_backoff: Duration::from_millis(250),
            max_write_attempts: 3,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    ///
    /// Recognized variables: `TETHER_DEBOUNCE_MS`, `TETHER_RETRY_BACKOFF_MS`,
    /// `TETHER_MAX_WRITE_ATTEMPTS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            debounce_interval: millis_from_env("TETHER_DEBOUNCE_MS")
                .unwrap_or(defaults.debounce_interval),
            retry_backoff: millis_from_env("TETHER_RETRY_BACKOFF_MS")
                .unwrap_or(defaults.retry_backoff),
            max_write_attempts: env::var("TETHER_MAX_WRITE_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_write_attempts),
        }
    }
}

fn millis_from_env(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}
