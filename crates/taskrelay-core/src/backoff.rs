//! Retry backoff policy.
//!
//! Exponential with a cap: the n-th failed attempt waits `base * 2^(n-1)`,
//! never more than `max`.

use chrono::{DateTime, Utc};
use std::time::Duration;

pub const DEFAULT_RETRY_BASE_SECS: u64 = 30;
pub const DEFAULT_RETRY_MAX_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_RETRY_BASE_SECS),
            Duration::from_secs(DEFAULT_RETRY_MAX_SECS),
        )
    }
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay after the task has been attempted `attempts` times.
    pub fn delay(&self, attempts: i32) -> Duration {
        if attempts <= 0 {
            return Duration::ZERO;
        }
        let exponent = (attempts - 1).min(31) as u32;
        1u32.checked_shl(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// When a failed task becomes eligible again. Never earlier than `previous`.
    pub fn next_available_at(
        &self,
        attempts: i32,
        now: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::zero());
        now.checked_add_signed(delay).unwrap_or(now).max(previous)
    }
}
