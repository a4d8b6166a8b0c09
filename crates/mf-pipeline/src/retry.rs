//! Retry policy for transient step failures.

use std::time::Duration;

use mf_core::config::RetryConfig;

use crate::step::StepDefinition;

/// Exponential backoff: the n-th retry (0-based) waits `base * 2^n`, capped
/// at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` failed attempts
    /// ending in `err`.
    pub fn should_retry(&self, def: &StepDefinition, err: &mf_core::Error, attempts: u32) -> bool {
        def.retryable() && err.is_transient() && attempts <= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn delays_double_until_cap() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
        assert_eq!(p.delay_for(4), Duration::from_millis(1000));
        assert_eq!(p.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn only_transient_errors_on_retryable_steps() {
        let p = policy();
        let retryable = StepDefinition::builder("analyze").retryable(true).build();
        let plain = StepDefinition::builder("compress").build();
        let transient = mf_core::Error::analysis_transient("503 Service Unavailable");
        let permanent = mf_core::Error::analysis("schema mismatch");

        assert!(p.should_retry(&retryable, &transient, 1));
        assert!(p.should_retry(&retryable, &transient, 3));
        assert!(!p.should_retry(&retryable, &transient, 4));
        assert!(!p.should_retry(&retryable, &permanent, 1));
        assert!(!p.should_retry(&plain, &transient, 1));
    }

    #[test]
    fn from_default_config() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.base_delay, Duration::from_millis(500));
        assert_eq!(p.max_delay, Duration::from_secs(30));
    }
}
