//! Reconnect backoff policy for the live channel.
//!
//! Delays grow exponentially from `initial` and are capped at `max`. Jitter
//! is added below the cap only and is kept smaller than `initial`, so the
//! sequence of delays never decreases.

use std::time::Duration;

/// Exponential backoff with a cap and a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Attempts allowed before the disconnect is declared unrecoverable.
    pub max_attempts: u32,
    /// Upper bound for random jitter added to uncapped delays.
    pub jitter: Duration,
}

impl BackoffPolicy {
    /// Create a policy without jitter.
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
            jitter: Duration::ZERO,
        }
    }

    /// Set the jitter bound. Values at or above `initial` are clamped below it.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter.min(self.initial.saturating_sub(Duration::from_millis(1)));
        self
    }

    /// Delay to wait before reconnect attempt number `attempt` (1-based).
    ///
    /// Formula: min(max, initial * 2^(attempt-1) + random(0..jitter)).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self
            .initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max);
        if base >= self.max {
            return self.max;
        }
        (base + random_jitter(self.jitter)).min(self.max)
    }

    /// Whether `attempt` is past the allowed number of attempts.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

impl Default for BackoffPolicy {
    /// 5s initial, 10 minute cap, 8 attempts, up to 1s jitter.
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(600), 8)
            .with_jitter(Duration::from_millis(1000))
    }
}

fn random_jitter(bound: Duration) -> Duration {
    let bound_ms = bound.as_millis() as u64;
    if bound_ms == 0 {
        return Duration::ZERO;
    }
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return Duration::ZERO;
    }
    Duration::from_millis(u64::from_le_bytes(bytes) % bound_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 10);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn jittered_delays_never_decrease() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let mut previous = Duration::ZERO;
            for attempt in 1..=12 {
                let delay = policy.delay_for(attempt);
                assert!(delay >= previous, "attempt {} went backwards", attempt);
                assert!(delay <= policy.max);
                previous = delay;
            }
        }
    }

    #[test]
    fn jitter_is_clamped_below_initial() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 3)
            .with_jitter(Duration::from_secs(5));
        assert!(policy.jitter < policy.initial);
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 3);
        assert!(!policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }
}
