//! Bounded retries for advisory lock acquisition.

use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles from `base` up to `max`, spread by up to ±10% per retry.
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// 100 retries, 100ms doubling up to 5s.
    fn default() -> Self {
        Self::exponential(100, Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Whether another attempt is allowed after `retries` retries.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Sleep before retry number `retry` (1-based).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let doubled = base.saturating_mul(1u32 << (retry - 1).min(31)).min(max);
                let millis = doubled.as_millis() as i64;
                // Per-mille offset in [-100, 100], fixed per retry number.
                let permille = i64::from(retry.wrapping_mul(37) % 201) - 100;
                let spread = millis * permille / 1000;
                let ceiling = max.max(base).as_millis() as i64;
                Duration::from_millis((millis + spread).clamp(0, ceiling) as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn near(delay: Duration, millis: u64) -> bool {
        let delay = delay.as_millis() as u64;
        delay >= millis * 9 / 10 && delay <= millis * 11 / 10
    }

    #[test]
    fn exponential_delays_double_until_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(1000));

        assert!(near(policy.delay_for_attempt(1), 100));
        assert!(near(policy.delay_for_attempt(2), 200));
        assert!(near(policy.delay_for_attempt(3), 400));
        assert!(near(policy.delay_for_attempt(4), 800));
        assert!(policy.delay_for_attempt(9) <= Duration::from_millis(1000));
        assert!(near(policy.delay_for_attempt(9), 1000));
    }

    #[test]
    fn fixed_delays_are_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn default_backs_off_to_five_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 100);
        let capped = policy.delay_for_attempt(100);
        assert!(capped <= Duration::from_secs(5));
        assert!(capped >= Duration::from_millis(4500));
    }

    proptest! {
        #[test]
        fn delays_stay_within_bounds(retry in 1u32..500) {
            let delay = RetryPolicy::default().delay_for_attempt(retry);
            prop_assert!(delay <= Duration::from_secs(5));
            prop_assert!(delay >= Duration::from_millis(90));
        }
    }
}
