//! Retry/backoff policy for failed sync attempts (§4.4 "retry").

use std::time::Duration;

/// `delay = retry_delay_ms * backoff_multiplier^attempts`, capped at
/// `max_delay_ms` and giving up after `max_attempts`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retry_delay_ms: 1_000, backoff_multiplier: 2.0, max_delay_ms: 60_000, max_attempts: 5 }
    }
}

impl RetryPolicy {
    /// `None` once `attempts` has exhausted the policy's budget.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }
        let scaled = self.retry_delay_ms as f64 * self.backoff_multiplier.powi(attempts as i32);
        let millis = scaled.min(self.max_delay_ms as f64) as u64;
        Some(Duration::from_millis(millis))
    }

    #[must_use]
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
