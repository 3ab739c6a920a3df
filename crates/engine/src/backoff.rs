//! Retry policy: exponential backoff with jitter.
//!
//! `backoff(n) = min(cap, base * 2^n) + random(0, jitter)` where `n` is the
//! number of attempts already made. The deterministic part is monotonic in `n`
//! until it reaches `cap`; the jitter only ever adds.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use relay_common::config::AppConfig;

/// Default attempt budget per notification.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    pub max_attempts: i32,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
            jitter: Duration::from_millis(config.backoff_jitter_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Same policy without jitter. Handy when a test needs exact timestamps.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = Duration::ZERO;
        self
    }

    /// Deterministic part of the delay: `min(cap, base * 2^attempts)`.
    pub fn base_delay(&self, attempts: i32) -> Duration {
        let exponent = attempts.max(0) as u32;
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Full delay including a uniformly random jitter in `[0, jitter]`.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay(attempts) + jitter
    }

    /// Earliest time the next attempt may run after `attempts` attempts.
    pub fn next_attempt_at(&self, attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff(attempts);
        now + chrono::Duration::milliseconds(delay.as_millis() as i64)
    }

    pub fn is_exhausted(&self, attempts: i32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter: Duration::from_secs(1),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}
