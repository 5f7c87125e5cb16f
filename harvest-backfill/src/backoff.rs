//! Retry policy for failed imports

use std::time::Duration;

/// Longest sleep between two attempts at one descriptor
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(6 * 60 * 60);

/// What to do after a failed import attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Sleep, then put the descriptor back in the queue
    Retry(Duration),
    /// Retries exhausted; descriptor goes to `needs_review`
    GiveUp,
}

/// Exponential backoff: failed attempt `n` sleeps `base_delay * multiplier^(n-1)`,
/// capped at [`MAX_RETRY_DELAY`]
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier,
        }
    }

    /// Decide after the `attempt`-th failed importer call (1-based)
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt == 0 || attempt > self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }

    /// Sleep before the retry that follows failed attempt `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // 0 * inf is NaN; a non-zero base that overflowed still sleeps the cap
        let secs = if secs.is_nan() { 0.0 } else { secs };
        harvest_common::time::secs_f64_to_duration(secs).min(MAX_RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_10_30_90_then_give_up() {
        let policy = BackoffPolicy::new(3, Duration::from_secs(10), 3.0);

        assert_eq!(policy.decide(1), RetryDecision::Retry(Duration::from_secs(10)));
        assert_eq!(policy.decide(2), RetryDecision::Retry(Duration::from_secs(30)));
        assert_eq!(policy.decide(3), RetryDecision::Retry(Duration::from_secs(90)));
        assert_eq!(policy.decide(4), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_retries_gives_up_immediately() {
        let policy = BackoffPolicy::new(0, Duration::from_secs(10), 2.0);
        assert_eq!(policy.decide(1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_long_schedules_saturate_at_cap() {
        let policy = BackoffPolicy::new(40, Duration::from_secs(10), 3.0);

        assert_eq!(policy.decide(10), RetryDecision::Retry(MAX_RETRY_DELAY));
        assert_eq!(policy.decide(40), RetryDecision::Retry(MAX_RETRY_DELAY));
        assert_eq!(policy.decide(41), RetryDecision::GiveUp);

        // multiplier^n overflows to infinity: still the cap, never zero
        let policy = BackoffPolicy::new(u32::MAX, Duration::from_secs(1), 100.0);
        assert_eq!(policy.delay_for(400), MAX_RETRY_DELAY);
        assert_eq!(policy.delay_for(u32::MAX), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_zero_base_stays_zero() {
        let policy = BackoffPolicy::new(u32::MAX, Duration::ZERO, 100.0);
        assert_eq!(policy.delay_for(400), Duration::ZERO);
    }

    #[test]
    fn test_multiplier_one_is_constant() {
        let policy = BackoffPolicy::new(5, Duration::from_millis(500), 1.0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
    }
}
