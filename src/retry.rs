//! Backoff schedule and terminal-failure decisions.

use std::time::Duration;

/// Maps completed failed attempts to the next move: wait and retry, or
/// give up for good.
///
/// The delay schedule saturates at its last entry, and `max_retries`
/// bounds *total* attempts, not additional retries: one delivery
/// produces between 1 and `max_retries` attempts inclusive.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
    max_retries: u32,
}

/// What happens to a delivery after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the delay.
    Retry { delay: Duration },

    /// The attempt budget is spent; the delivery is terminally failed.
    GiveUp,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>, max_retries: u32) -> Self {
        Self {
            delays,
            max_retries,
        }
    }

    /// Decision after a failure that leaves `retry_count` completed
    /// failed attempts.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay_for(retry_count),
        }
    }

    /// Backoff before attempt `retry_count + 1`. `retry_count` is the
    /// 1-based number of the attempt just performed; indexes past the
    /// schedule reuse the last entry.
    fn delay_for(&self, retry_count: u32) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let index = (retry_count.max(1) as usize).min(self.delays.len()) - 1;
        self.delays[index]
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let config = crate::config::CourierConfig::default();
        Self::new(config.retry_delays, config.retry_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(60),
            ],
            5,
        )
    }

    #[test]
    fn schedule_is_walked_in_order() {
        let policy = policy();
        assert_eq!(
            policy.decide(1),
            RetryDecision::Retry {
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(
            policy.decide(2),
            RetryDecision::Retry {
                delay: Duration::from_secs(30)
            }
        );
        assert_eq!(
            policy.decide(3),
            RetryDecision::Retry {
                delay: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn schedule_saturates_at_last_entry() {
        let policy = policy();
        assert_eq!(
            policy.decide(4),
            RetryDecision::Retry {
                delay: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn budget_is_total_attempts() {
        let policy = policy();
        assert_eq!(policy.decide(5), RetryDecision::GiveUp);
        assert_eq!(policy.decide(6), RetryDecision::GiveUp);
    }

    #[test]
    fn single_attempt_budget_never_retries() {
        let policy = RetryPolicy::new(vec![Duration::from_secs(10)], 1);
        assert_eq!(policy.decide(1), RetryDecision::GiveUp);
    }

    #[test]
    fn default_matches_configured_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 5);
        assert_eq!(
            policy.decide(4),
            RetryDecision::Retry {
                delay: Duration::from_secs(5 * 60)
            }
        );
    }
}
