//! Exponential backoff with jitter.
//!
//! Every failed sync attempt asks the backoff for the delay before the next
//! attempt. The delay grows geometrically up to a cap; optional random jitter
//! spreads reconnects of many clients after a backend restart.
//!
//! Formula: min(max, initial * multiplier^attempt) + random(0..=max_jitter)

use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay of the first retry.
    pub initial: Duration,
    /// Upper bound of the base delay.
    pub max: Duration,
    /// Growth factor per attempt.
    pub multiplier: u32,
    /// Upper bound of the random jitter added on top.
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2,
            max_jitter: Duration::ZERO,
        }
    }
}

/// Stateful exponential backoff.
///
/// `next()` returns the next delay and grows the attempt counter; `reset()`
/// goes back to the initial delay after a success.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a backoff at attempt zero.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt.
    pub fn next(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        base.saturating_add(random_jitter(self.policy.max_jitter))
    }

    /// Back to the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self
            .policy
            .multiplier
            .max(1)
            .checked_pow(attempt)
            .unwrap_or(u32::MAX);
        self.policy
            .initial
            .checked_mul(factor)
            .unwrap_or(self.policy.max)
            .min(self.policy.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

/// Random jitter between zero and `max` (inclusive, millisecond resolution).
fn random_jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return Duration::ZERO;
    }
    let random = u64::from_le_bytes(bytes);
    match max_ms.checked_add(1) {
        Some(range) => Duration::from_millis(random % range),
        None => Duration::from_millis(random),
    }
}
