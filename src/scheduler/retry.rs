use std::time::Duration;

use crate::config::OrchestrationConfig;
use crate::executor::ExecutionError;

/// Exponential backoff for retryable executor failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestrationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry.base_delay_ms),
            max_delay: Duration::from_millis(config.retry.max_delay_ms),
            multiplier: config.retry.multiplier,
            jitter: config.retry.jitter,
        }
    }

    /// Same backoff, different retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether attempt number `attempt` (zero-based) may be followed by another
    pub fn should_retry(&self, error: &ExecutionError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }

    /// Delay before the attempt following `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * self.multiplier.powf(attempt as f64)).round().min(max_ms);
        let delay_ms = if self.jitter {
            // up to +25%, still capped
            (delay_ms * (1.0 + fastrand::f64() * 0.25)).min(max_ms)
        } else {
            delay_ms
        };
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OrchestrationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = policy(false);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = policy(true);
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_only_system_errors_retry() {
        let policy = policy(false);
        assert!(policy.should_retry(&ExecutionError::system("503"), 0));
        assert!(!policy.should_retry(&ExecutionError::system("503"), 3));
        assert!(!policy.should_retry(&ExecutionError::user("bad input"), 0));
        assert!(!policy.should_retry(&ExecutionError::Cancelled, 0));
    }
}
