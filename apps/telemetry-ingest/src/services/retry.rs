use std::time::Duration;

/// Exponential backoff with a hard attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempts: u32, delay: Duration },
    DeadLetter { attempts: u32, exhausted: bool },
}

impl RetryPolicy {
    /// Delay before the attempt following failure number `failed_attempts` (1-based).
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// True when delivery number `delivery` (1-based) would exceed the budget. Earlier
    /// deliveries were abandoned without a verdict, so the job must not run again.
    pub fn budget_spent(&self, delivery: u32) -> bool {
        delivery > self.max_attempts.max(1)
    }

    /// `previous_attempts` is the count carried on the job before the attempt that just failed.
    pub fn decide(&self, previous_attempts: u32, transient: bool) -> RetryDecision {
        let attempts = previous_attempts.saturating_add(1);
        if !transient {
            return RetryDecision::DeadLetter {
                attempts,
                exhausted: false,
            };
        }
        if attempts >= self.max_attempts.max(1) {
            return RetryDecision::DeadLetter {
                attempts,
                exhausted: true,
            };
        }
        RetryDecision::Retry {
            attempts,
            delay: self.backoff(attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        };
        let delays: Vec<u64> = (1..=7).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.backoff(200), Duration::from_secs(60));
    }

    #[test]
    fn fourth_delivery_is_over_budget() {
        let policy = RetryPolicy::default();
        assert!(!policy.budget_spent(1));
        assert!(!policy.budget_spent(3));
        assert!(policy.budget_spent(4));
    }

    #[test]
    fn transient_failures_retry_until_the_budget_is_spent() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(0, true),
            RetryDecision::Retry {
                attempts: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            policy.decide(1, true),
            RetryDecision::Retry {
                attempts: 2,
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(
            policy.decide(2, true),
            RetryDecision::DeadLetter {
                attempts: 3,
                exhausted: true
            }
        );
    }

    #[test]
    fn terminal_failures_skip_retries() {
        assert_eq!(
            RetryPolicy::default().decide(0, false),
            RetryDecision::DeadLetter {
                attempts: 1,
                exhausted: false
            }
        );
    }
}
