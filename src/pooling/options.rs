//! Pool configuration.

use std::time::Duration;

/// Default capacity of a pool.
pub const DEFAULT_CAPACITY: usize = 3;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default base delay between attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// How a failed request consumes its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Timeouts and business errors are retried alike.
    #[default]
    Uniform,
    /// Errors that look permanent (401/403/404, "not found", ...) skip straight
    /// to the fallback; everything else is retried.
    SkipPermanent,
}

impl RetryPolicy {
    /// Parse a policy name as used in configuration.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "uniform" => Some(Self::Uniform),
            "skip-permanent" | "skip_permanent" => Some(Self::SkipPermanent),
            _ => None,
        }
    }
}

/// Options a [`Pool`](super::Pool) is constructed with.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of jobs holding an execution slot at once.
    pub capacity: usize,
    /// Deadline of a single attempt (and of the fallback).
    pub timeout: Duration,
    /// Retries after the first attempt before the fallback runs.
    pub max_retries: u32,
    /// Base delay between attempts, doubled on each retry.
    pub backoff: Duration,
    pub retry_policy: RetryPolicy,
}

impl PoolOptions {
    #[must_use]
    pub fn new(capacity: usize, timeout: Duration, max_retries: u32) -> Self {
        Self {
            capacity,
            timeout,
            max_retries,
            backoff: DEFAULT_BACKOFF,
            retry_policy: RetryPolicy::Uniform,
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Delay before retry number `retry` (1-based), capped at the timeout.
    pub(crate) fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(self.timeout)
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let opts = PoolOptions::new(1, Duration::from_secs(5), 3)
            .with_backoff(Duration::from_secs(1));
        assert_eq!(opts.backoff_for(1), Duration::from_secs(1));
        assert_eq!(opts.backoff_for(2), Duration::from_secs(2));
        assert_eq!(opts.backoff_for(3), Duration::from_secs(4));
        assert_eq!(opts.backoff_for(4), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_retry_policy() {
        assert_eq!(RetryPolicy::parse("uniform"), Some(RetryPolicy::Uniform));
        assert_eq!(
            RetryPolicy::parse("Skip-Permanent"),
            Some(RetryPolicy::SkipPermanent)
        );
        assert_eq!(RetryPolicy::parse("sometimes"), None);
    }
}
