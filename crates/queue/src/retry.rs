//! Retry policy shared by the message queues and the task scheduler.

use std::time::Duration;

use meetq_common::MessageQueueConfig;

/// Linear backoff capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay added per attempt.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl From<&MessageQueueConfig> for RetryPolicy {
    fn from(config: &MessageQueueConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_secs(config.retry_max_delay_secs),
        }
    }
}

/// What to do with an item whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after the delay.
    Retry(Duration),
    /// Budget spent; route to the dead-letter destination.
    Exhausted,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }

    /// Record a failure and decide whether to retry.
    ///
    /// `retry_count` is incremented on every failure once a budget exists,
    /// so an item that failed `k` times with `max_retries == k` is exhausted
    /// carrying `retry_count == k`.
    #[must_use]
    pub fn next_attempt(&self, retry_count: &mut u32, max_retries: u32) -> RetryDecision {
        if max_retries == 0 {
            return RetryDecision::Exhausted;
        }
        *retry_count = retry_count.saturating_add(1);
        if *retry_count < max_retries {
            RetryDecision::Retry(self.delay_for_attempt(*retry_count))
        } else {
            RetryDecision::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(5));
    }

    #[test]
    fn test_max_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_budget_of_three() {
        let policy = RetryPolicy::default();
        let mut count = 0;

        assert!(matches!(policy.next_attempt(&mut count, 3), RetryDecision::Retry(_)));
        assert!(matches!(policy.next_attempt(&mut count, 3), RetryDecision::Retry(_)));
        assert_eq!(policy.next_attempt(&mut count, 3), RetryDecision::Exhausted);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_zero_budget_fails_immediately() {
        let policy = RetryPolicy::default();
        let mut count = 0;

        assert_eq!(policy.next_attempt(&mut count, 0), RetryDecision::Exhausted);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_from_config() {
        let config = MessageQueueConfig {
            retry_base_delay_ms: 250,
            retry_max_delay_secs: 5,
            ..Default::default()
        };
        let policy = RetryPolicy::from(&config);

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_secs(5));
    }
}
