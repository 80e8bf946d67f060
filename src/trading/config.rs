//! Replication policy constants.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Policy knobs for sizing, risk, retry, and pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Daily drawdown that forces a flatten (0.0 to 1.0)
    pub drawdown_threshold: Decimal,

    /// Smallest lot the copier will ever send
    pub min_lot: Decimal,

    /// Attempts per broker operation (first try included)
    pub retry_attempts: u32,

    /// Fixed wait between attempts (milliseconds)
    pub retry_delay_ms: u64,

    /// Reconciliation period, also the idle wait while paused (milliseconds)
    pub poll_interval_ms: u64,

    /// Wait after a flatten before re-baselining (milliseconds)
    pub flatten_cooldown_ms: u64,

    /// Maximum price deviation on market orders (points)
    pub order_deviation: u32,

    /// Magic number stamped on every replicated order
    pub order_magic: u64,

    /// Age after which the last master poll counts as "no connectivity" (seconds)
    pub stale_after_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            drawdown_threshold: dec!(0.03), // 3% daily
            min_lot: dec!(0.01),
            retry_attempts: 3,
            retry_delay_ms: 5_000,
            poll_interval_ms: 1_000,
            flatten_cooldown_ms: 5_000,
            order_deviation: 20,
            order_magic: 12345,
            stale_after_secs: 10,
        }
    }
}

impl PolicyConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn flatten_cooldown(&self) -> Duration {
        Duration::from_millis(self.flatten_cooldown_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Override fields from `REPLICATOR_*` environment variables.
    ///
    /// Unparseable values are ignored and the configured value is kept.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("REPLICATOR_DRAWDOWN_THRESHOLD") {
            self.drawdown_threshold = v;
        }
        if let Some(v) = env_parse("REPLICATOR_MIN_LOT") {
            self.min_lot = v;
        }
        if let Some(v) = env_parse("REPLICATOR_RETRY_ATTEMPTS") {
            self.retry_attempts = v;
        }
        if let Some(v) = env_parse("REPLICATOR_RETRY_DELAY_MS") {
            self.retry_delay_ms = v;
        }
        if let Some(v) = env_parse("REPLICATOR_POLL_INTERVAL_MS") {
            self.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("REPLICATOR_FLATTEN_COOLDOWN_MS") {
            self.flatten_cooldown_ms = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
