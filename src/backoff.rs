//! Exponential backoff with jitter for watch reconnects.

use std::time::Duration;

use rand::Rng;

/// Reconnect delay policy.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms.max(base_ms)),
        }
    }

    /// Delay before reconnect number `attempt` (1-based). Attempt 0 is
    /// immediate.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let exponential = 2u64.saturating_pow(attempt - 1);
        let capped = base_ms.saturating_mul(exponential).min(max_ms);

        // Up to 10% jitter on top.
        let jitter_range = capped / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped + jitter)
    }
}
