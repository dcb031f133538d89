//! Retry delay computation
//!
//! Backoff is a pure function of `(attempt_index, category)`. The runner asks
//! for a delay and sleeps through its injected clock; nothing in here reads
//! time.

use crate::error::ErrorCategory;
use std::time::Duration;

/// Exponential backoff with a cap and per-category scaling
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub transient_multiplier: f64,
    pub timeout_multiplier: f64,
    /// Flat delay before the corrective retry of a validation failure
    pub validation_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
            transient_multiplier: 1.0,
            timeout_multiplier: 1.0,
            validation_delay: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    /// Policy that never waits; handy for tests that count attempts only
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            validation_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows failed attempt `attempt_index` (0-based)
    ///
    /// Returns `None` for categories that must not be retried.
    pub fn delay(&self, attempt_index: u32, category: ErrorCategory) -> Option<Duration> {
        let multiplier = match category {
            ErrorCategory::Fatal => return None,
            ErrorCategory::Validation => return Some(self.validation_delay.min(self.max_delay)),
            ErrorCategory::Transient => self.transient_multiplier,
            ErrorCategory::Timeout => self.timeout_multiplier,
        };

        let cap = u64::try_from(self.max_delay.as_nanos()).unwrap_or(u64::MAX);
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_nanos() as f64
            * self.factor.max(1.0).powi(exponent)
            * multiplier.max(0.0);
        let nanos = if raw.is_finite() && raw < cap as f64 {
            raw.round() as u64
        } else {
            cap
        };

        Some(Duration::from_nanos(nanos.min(cap)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_millis(1000),
            transient_multiplier: 1.0,
            timeout_multiplier: 1.5,
            validation_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_exponential_sequence_until_cap() {
        let policy = policy();
        let delays: Vec<u128> = (0..6)
            .map(|i| {
                policy
                    .delay(i, ErrorCategory::Transient)
                    .unwrap()
                    .as_millis()
            })
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_timeout_multiplier_applies() {
        let policy = policy();
        assert_eq!(
            policy.delay(1, ErrorCategory::Timeout),
            Some(Duration::from_millis(300))
        );
    }

    #[test]
    fn test_fatal_is_never_retried() {
        assert_eq!(policy().delay(0, ErrorCategory::Fatal), None);
    }

    #[test]
    fn test_validation_uses_flat_delay() {
        let policy = policy();
        assert_eq!(
            policy.delay(0, ErrorCategory::Validation),
            Some(Duration::from_millis(10))
        );
        assert_eq!(
            policy.delay(5, ErrorCategory::Validation),
            Some(Duration::from_millis(10))
        );
    }

    #[test]
    fn test_immediate_policy_is_zero() {
        let policy = BackoffPolicy::immediate();
        assert_eq!(
            policy.delay(3, ErrorCategory::Transient),
            Some(Duration::ZERO)
        );
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_cap(index in 0u32..10_000, base_ms in 0u64..5_000, cap_ms in 0u64..60_000) {
            let policy = BackoffPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(cap_ms),
                ..BackoffPolicy::default()
            };
            for category in [ErrorCategory::Transient, ErrorCategory::Timeout, ErrorCategory::Validation] {
                let delay = policy.delay(index, category).unwrap();
                prop_assert!(delay <= policy.max_delay);
            }
        }

        #[test]
        fn delay_is_monotonic_in_attempt_index(index in 0u32..64) {
            let policy = policy();
            let current = policy.delay(index, ErrorCategory::Transient).unwrap();
            let next = policy.delay(index + 1, ErrorCategory::Transient).unwrap();
            prop_assert!(next >= current);
        }
    }
}
