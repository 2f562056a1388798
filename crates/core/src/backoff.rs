use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Exponential reconnect delay: `min(factor^attempt * base, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based; 0 yields the base delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.factor.powi(exponent) * self.base_delay_ms as f64;
        let capped = scaled.min(self.max_delay_ms as f64);
        // Truncate like a millisecond timer would; NaN from a bad factor lands on zero.
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Replaces nonsensical values with defaults.
    pub fn normalized(mut self) -> Self {
        if !self.factor.is_finite() || self.factor < 1.0 {
            self.factor = DEFAULT_BACKOFF_FACTOR;
        }
        if self.base_delay_ms == 0 {
            self.base_delay_ms = DEFAULT_BASE_DELAY_MS;
        }
        if self.max_delay_ms < self.base_delay_ms {
            self.max_delay_ms = self.base_delay_ms;
        }
        self
    }
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
