//! Retry & poison policy: decides what a rollback turns into.
//!
//! error_count が上限に達したメッセージは Error（poison）になり、二度と claim されない。

use std::time::Duration;

use crate::error::ConfigError;

/// How `visible_at` is pushed forward on each requeue.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Requeued messages are visible again immediately.
    None,
    /// `step * error_count`
    Linear { step: Duration },
    /// `base * multiplier^(error_count - 1)`
    Exponential { base: Duration, multiplier: f64 },
}

impl Backoff {
    /// Uncapped delay for the `error_count`-th failure (1-indexed).
    pub fn delay(&self, error_count: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { step } => step.saturating_mul(error_count.max(1)),
            Backoff::Exponential { base, multiplier } => {
                let exponent = error_count.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = base.as_secs_f64() * multiplier.powi(exponent);
                // powi overflows to inf long before Duration does
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
            }
        }
    }
}

/// What happens to a message after a failed processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Waiting`, claimable after `delay`.
    Requeue { delay: Duration, error_count: u32 },
    /// Retry budget spent; park in `Error`.
    Poison { error_count: u32 },
}

impl RetryDecision {
    pub fn error_count(&self) -> u32 {
        match self {
            RetryDecision::Requeue { error_count, .. } | RetryDecision::Poison { error_count } => {
                *error_count
            }
        }
    }
}

/// Retry policy shared by rollback and the lease-reclaim sweep.
///
/// Pure: same input, same decision. Applying the decision is the store's job.
///
/// Example with the default policy (max 5, 2s x2, ceiling 5min):
/// - rollback 1: requeue after 2s
/// - rollback 2: requeue after 4s
/// - rollback 4: requeue after 16s
/// - rollback 5: poison
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Rollbacks allowed before a message is poisoned.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Upper bound on any single delay, including handler-requested ones.
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(2),
                multiplier: 2.0,
            },
            ceiling: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            ..Self::default()
        }
    }

    /// No delay between attempts; handy for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Backoff::None)
    }

    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroMaxRetries);
        }
        Ok(())
    }

    /// Capped delay for the `error_count`-th failure.
    pub fn next_delay(&self, error_count: u32) -> Duration {
        self.backoff.delay(error_count).min(self.ceiling)
    }

    /// Decide the fate of a message that already failed `previous_errors` times
    /// and just failed again.
    ///
    /// `requested` is a delay asked for by the handler; it replaces the backoff
    /// but is still capped by the ceiling.
    pub fn decide(&self, previous_errors: u32, requested: Option<Duration>) -> RetryDecision {
        let error_count = previous_errors.saturating_add(1);
        if error_count >= self.max_retries {
            return RetryDecision::Poison { error_count };
        }
        let delay = match requested {
            Some(delay) => delay.min(self.ceiling),
            None => self.next_delay(error_count),
        };
        RetryDecision::Requeue { delay, error_count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.ceiling, Duration::from_secs(300));
        assert!(policy.validate().is_ok());
    }

    #[rstest]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(4, 16)]
    #[case(9, 300)]
    fn exponential_backoff_is_capped(#[case] error_count: u32, #[case] secs: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(error_count), Duration::from_secs(secs));
    }

    #[test]
    fn linear_backoff_grows_by_step() {
        let backoff = Backoff::Linear {
            step: Duration::from_secs(3),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(3));
        assert_eq!(backoff.delay(4), Duration::from_secs(12));
    }

    #[test]
    fn huge_exponent_saturates() {
        let policy = RetryPolicy::default().with_ceiling(Duration::MAX);
        assert_eq!(policy.next_delay(u32::MAX), Duration::MAX);
    }

    #[test]
    fn poisons_on_the_max_th_failure() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(
            policy.decide(0, None),
            RetryDecision::Requeue {
                delay: Duration::ZERO,
                error_count: 1
            }
        );
        assert_eq!(
            policy.decide(1, None),
            RetryDecision::Requeue {
                delay: Duration::ZERO,
                error_count: 2
            }
        );
        assert_eq!(policy.decide(2, None), RetryDecision::Poison { error_count: 3 });
    }

    #[test]
    fn requested_delay_overrides_backoff_but_not_ceiling() {
        let policy = RetryPolicy::default().with_ceiling(Duration::from_secs(60));
        assert_eq!(
            policy.decide(0, Some(Duration::from_secs(30))),
            RetryDecision::Requeue {
                delay: Duration::from_secs(30),
                error_count: 1
            }
        );
        assert_eq!(
            policy.decide(0, Some(Duration::from_secs(600))).error_count(),
            1
        );
        assert!(matches!(
            policy.decide(0, Some(Duration::from_secs(600))),
            RetryDecision::Requeue { delay, .. } if delay == Duration::from_secs(60)
        ));
    }

    #[test]
    fn zero_max_retries_is_invalid() {
        assert_eq!(
            RetryPolicy::immediate(0).validate().unwrap_err(),
            ConfigError::ZeroMaxRetries
        );
    }
}
