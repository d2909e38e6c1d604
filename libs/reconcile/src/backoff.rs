//! Exponential backoff with bounded positive jitter.

use std::time::Duration;

use rand::Rng;

use crate::{DEFAULT_BASE_DELAY, DEFAULT_JITTER, DEFAULT_MAX_DELAY};

/// Backoff policy for retries and reconnects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0). Jitter is only ever added, never
    /// subtracted, so a delay is never shorter than the nominal one.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy.
    pub const fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self { base, max, jitter }
    }

    /// Delay for the given attempt without jitter: `base * 2^attempt`, capped.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Calculate delay for the given attempt number.
    ///
    /// The result lies in `[nominal, nominal * (1 + jitter)]`, clamped to `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }

        let factor = rand::rng().random_range(0.0..=self.jitter.min(1.0));
        let jitter = Duration::from_secs_f64(nominal.as_secs_f64() * factor);
        (nominal + jitter).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 10)]
    #[case(1, 20)]
    #[case(2, 40)]
    #[case(5, 320)]
    fn test_nominal_doubles(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.nominal(attempt).as_millis(),
            Duration::from_millis(expected_ms).as_millis()
        );
    }

    #[test]
    fn test_nominal_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.nominal(30), policy.max);
        assert_eq!(policy.nominal(u32::MAX), policy.max);
    }

    #[test]
    fn test_delay_jitter_is_bounded() {
        let policy = BackoffPolicy::default();
        for attempt in 0..12 {
            let nominal = policy.nominal(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= nominal, "attempt {attempt}: {delay:?} < {nominal:?}");
                assert!(delay.as_secs_f64() <= nominal.as_secs_f64() * 1.1 + 1e-6);
            }
        }
    }

    #[test]
    fn test_delay_never_exceeds_max() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            assert!(policy.delay(40) <= policy.max);
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 0.0);
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
    }
}
