//! Retry backoff policy.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use ispadmin_core::{DomainError, DomainResult};

/// Exponential backoff with a cap.
///
/// `backoff(n) = min(base_delay * multiplier^(n-1), max_delay)` for `n >= 1`,
/// and zero for `n == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    /// Extra random spread as a fraction of the delay (0.0-1.0). Zero disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            multiplier: 2,
            max_delay: Duration::from_secs(60 * 60),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, multiplier: u32, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.multiplier < 1 {
            return Err(DomainError::validation("retry multiplier must be >= 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(DomainError::validation("retry base delay exceeds the cap"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(DomainError::validation("retry jitter must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Deterministic delay before retry number `retry_count` (1-indexed).
    pub fn backoff(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }

        self.multiplier
            .checked_pow(retry_count - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `backoff` plus seeded jitter, still clamped to `max_delay`.
    pub fn backoff_with_jitter(&self, retry_count: u32, seed: u64) -> Duration {
        let delay = self.backoff(retry_count);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        let mut rng = StdRng::seed_from_u64(seed ^ u64::from(retry_count));
        let spread = rng.gen_range(0.0..=self.jitter);
        delay.mul_f64(1.0 + spread).min(self.max_delay)
    }

    /// Delay used by the queue: jittered when jitter is configured.
    pub fn delay_for(&self, retry_count: u32, seed: u64) -> Duration {
        if self.jitter > 0.0 {
            self.backoff_with_jitter(retry_count, seed)
        } else {
            self.backoff(retry_count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_doubles_from_thirty_seconds() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(120));
        assert_eq!(policy.backoff(8), Duration::from_secs(3600));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn jitter_is_reproducible_per_seed() {
        let policy = RetryPolicy::default().with_jitter(0.5);

        let a = policy.backoff_with_jitter(2, 42);
        let b = policy.backoff_with_jitter(2, 42);
        assert_eq!(a, b);
        assert!(a >= policy.backoff(2));
        assert!(a <= policy.backoff(2).mul_f64(1.5));
        assert!(policy.backoff_with_jitter(30, 7) <= policy.max_delay);
    }

    #[test]
    fn validate_rejects_nonsense() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().with_jitter(2.0).validate().is_err());
        let zero = RetryPolicy::exponential(Duration::from_secs(1), 0, Duration::from_secs(5));
        assert!(zero.validate().is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Backoff never decreases and never exceeds the cap.
            #[test]
            fn backoff_is_monotonic_and_capped(
                base_ms in 1u64..10_000,
                multiplier in 1u32..5,
                cap_factor in 1u64..1_000,
                n in 0u32..200,
            ) {
                let policy = RetryPolicy::exponential(
                    Duration::from_millis(base_ms),
                    multiplier,
                    Duration::from_millis(base_ms * cap_factor),
                );
                prop_assert!(policy.backoff(n) <= policy.backoff(n + 1));
                prop_assert!(policy.backoff(n) <= policy.max_delay);
            }

            /// With a multiplier of at least two, delays strictly grow until the cap.
            #[test]
            fn backoff_strictly_increases_below_cap(n in 1u32..40) {
                let policy = RetryPolicy::default();
                if policy.backoff(n + 1) < policy.max_delay {
                    prop_assert!(policy.backoff(n) < policy.backoff(n + 1));
                }
            }

            /// Jitter never pushes a delay past the cap.
            #[test]
            fn jittered_delay_is_capped(n in 0u32..64, seed in any::<u64>()) {
                let policy = RetryPolicy::default().with_jitter(1.0);
                prop_assert!(policy.backoff_with_jitter(n, seed) <= policy.max_delay);
            }
        }
    }
}
