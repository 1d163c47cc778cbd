//! Retry policy: decides backoff delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff: `base_delay * multiplier^(attempts - 1)`, capped at
/// `max_delay`.
///
/// Used for redelivery of a retried task and for transient store failures.
///
/// Example with base_delay=2s, multiplier=2.0:
/// - attempt 1: 2s
/// - attempt 2: 4s
/// - attempt 3: 8s
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 600_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            multiplier,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Delay before the next try, given the number of attempts already made
    /// (1-indexed; 0 is treated like 1).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(64) as i32;
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}
