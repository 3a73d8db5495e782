//! Session configuration.
//!
//! All options have defaults and can be overridden per deployment, either
//! in code or from a JSON document where any subset of keys may be given:
//!
//! ```text
//! { "heartbeat_interval_ms": 2000, "max_save_retries": 5 }
//! ```

use serde::Deserialize;
use std::time::Duration;

/// Timing and retry options for one collaboration session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Interval between heartbeat pings while connected.
    pub heartbeat_interval_ms: u64,
    /// A peer silent for this long is dropped from the awareness store.
    pub presence_timeout_ms: u64,
    /// First reconnect delay.
    pub backoff_base_ms: u64,
    /// Upper bound on the reconnect delay.
    pub backoff_cap_ms: u64,
    /// Quiet period after the last mutation before an auto-save fires.
    pub auto_save_debounce_ms: u64,
    /// Retries after a failed save before giving up.
    pub max_save_retries: u32,
    /// Fixed delay between save retries.
    pub save_retry_delay_ms: u64,
    /// Time allowed for the sync handshake to complete.
    pub handshake_timeout_ms: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            presence_timeout_ms: 30_000,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            auto_save_debounce_ms: 30_000,
            max_save_retries: 3,
            save_retry_delay_ms: 2_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl CollabConfig {
    /// Short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval_ms: 100,
            presence_timeout_ms: 1_000,
            backoff_base_ms: 50,
            backoff_cap_ms: 400,
            auto_save_debounce_ms: 200,
            max_save_retries: 2,
            save_retry_delay_ms: 50,
            handshake_timeout_ms: 500,
        }
    }

    /// Parse overrides from JSON; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    /// Presence sweep period. Half the timeout so a silent peer is dropped
    /// at most 1.5 timeouts after its last message.
    pub fn presence_sweep_interval(&self) -> Duration {
        Duration::from_millis((self.presence_timeout_ms / 2).max(1))
    }

    pub fn auto_save_debounce(&self) -> Duration {
        Duration::from_millis(self.auto_save_debounce_ms)
    }

    pub fn save_retry_delay(&self) -> Duration {
        Duration::from_millis(self.save_retry_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Reconnect delay for the given attempt: `min(base * 2^attempt, cap)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }
}
