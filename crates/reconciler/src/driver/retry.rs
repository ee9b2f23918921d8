//! Bounded exponential backoff.

use std::time::Duration;

use crate::config::RetryConfig;

/// Calculate backoff duration with exponential growth, capped at `max_ms`.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let backoff = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(backoff.min(max_ms))
}

/// Retry policy derived from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub use_jitter: bool,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            base_backoff_ms,
            max_backoff_ms,
            use_jitter: true,
        }
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let capped = calculate_backoff(
            attempt.saturating_sub(1),
            self.base_backoff_ms,
            self.max_backoff_ms,
        );
        if self.use_jitter {
            let millis = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
            let jitter_range = (millis / 4).max(1);
            let jitter = rand::random::<u64>() % (2 * jitter_range);
            Duration::from_millis(millis.saturating_add(jitter))
        } else {
            capped
        }
    }

    /// Whether another attempt may follow `attempt` (1-based).
    #[must_use]
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let policy = Self::new(
            config.max_attempts,
            config.base_backoff_ms,
            config.max_backoff_ms,
        );
        if config.jitter {
            policy
        } else {
            policy.without_jitter()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_grows_and_caps() {
        assert_eq!(calculate_backoff(0, 100, 10_000), Duration::from_millis(100));
        assert_eq!(calculate_backoff(3, 100, 10_000), Duration::from_millis(800));
        assert_eq!(calculate_backoff(20, 100, 10_000), Duration::from_millis(10_000));
        assert_eq!(calculate_backoff(u32::MAX, 100, 10_000), Duration::from_millis(10_000));
    }

    #[test]
    fn test_backoff_without_jitter() {
        let policy = RetryPolicy::new(3, 100, 1_000).without_jitter();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let policy = RetryPolicy::new(3, 100, 1_000);
        for _ in 0..100 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(300));
        }
    }

    #[test]
    fn test_can_retry() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert!(policy.can_retry(1));
        assert!(policy.can_retry(2));
        assert!(!policy.can_retry(3));
    }
}
