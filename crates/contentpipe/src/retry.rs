//! Retry policy: pure mapping from a failed attempt to its consequence.

use std::time::Duration;

use rand::Rng;

use crate::models::FailureKind;

/// Jitter applied around the exponential delay (±20 %).
const JITTER_FRACTION: f64 = 0.2;

/// What to do with an intent after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule the next attempt after this delay.
    Retry(Duration),
    /// Stop retrying; the intent is deadlettered.
    Deadletter,
}

/// Backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Decide the fate of an intent whose attempt number `attempt_count`
    /// (1-based, as persisted at claim time) just failed.
    pub fn decide(
        &self,
        attempt_count: u32,
        max_attempts: u32,
        kind: FailureKind,
    ) -> RetryDecision {
        match kind {
            FailureKind::Permanent => RetryDecision::Deadletter,
            FailureKind::Transient if attempt_count >= max_attempts => RetryDecision::Deadletter,
            FailureKind::Transient => RetryDecision::Retry(self.delay_for(attempt_count)),
        }
    }

    /// `min(cap, base · 2^(k-1))` with ±20 % jitter.
    fn delay_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(32);
        let unjittered = self
            .base
            .checked_mul(1u32 << exponent.min(31))
            .unwrap_or(self.cap)
            .min(self.cap);

        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let jittered = unjittered.as_secs_f64() * (1.0 + jitter);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}
