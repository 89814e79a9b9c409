//! Retry policy value object.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use super::task_error::{ErrorCode, TaskError};
use crate::{Error, Result};

/// Upper bound accepted for `max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// How the delay grows between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `initial_delay * 2^(n-1)`, optionally capped.
    #[default]
    Exponential,
    /// `initial_delay` for every attempt.
    Fixed,
}

/// Retry policy for transient errors.
///
/// Attempts are numbered from 1 and count retries only: the first try of a
/// transfer is not an attempt in this sense, so `max_attempts = 0` disables
/// retrying entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0..=10).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Optional cap on the computed delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: Option<u64>,
    /// Error codes eligible for retry. `None` retries every retryable error.
    #[serde(default)]
    pub retry_on: Option<BTreeSet<ErrorCode>>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> Option<u64> {
    Some(30_000)
}

impl RetryPolicy {
    /// Create a new retry policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exponential policy with the given attempt budget.
    pub fn exponential(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: Option<u64>) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms,
            max_delay_ms,
            retry_on: None,
        }
    }

    /// Fixed-delay policy with the given attempt budget.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Fixed,
            initial_delay_ms: delay_ms,
            max_delay_ms: None,
            retry_on: None,
        }
    }

    /// Create a retry policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Restrict retries to the given codes.
    pub fn with_retry_on(mut self, codes: impl IntoIterator<Item = ErrorCode>) -> Self {
        self.retry_on = Some(codes.into_iter().collect());
        self
    }

    /// Check that the policy is within accepted bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(Error::invalid_argument(format!(
                "retry max_attempts must be between 0 and {}, got {}",
                MAX_ATTEMPTS_LIMIT, self.max_attempts
            )));
        }
        if let Some(max) = self.max_delay_ms
            && max < self.initial_delay_ms
        {
            return Err(Error::invalid_argument(format!(
                "retry max_delay_ms ({}) is smaller than initial_delay_ms ({})",
                max, self.initial_delay_ms
            )));
        }
        Ok(())
    }

    /// Whether retry attempt `attempt` (1-based) is permitted.
    pub fn is_attempt_permitted(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// Delay before retry attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = match self.backoff {
            BackoffStrategy::Fixed => self.initial_delay_ms,
            BackoffStrategy::Exponential => {
                // Shifts past 63 saturate instead of overflowing.
                let multiplier = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.initial_delay_ms.saturating_mul(multiplier)
            }
        };

        let capped = match self.max_delay_ms {
            Some(max) if self.backoff == BackoffStrategy::Exponential => delay_ms.min(max),
            _ => delay_ms,
        };

        Duration::from_millis(capped)
    }

    /// Whether the given code may be retried under this policy.
    pub fn is_code_eligible(&self, code: ErrorCode) -> bool {
        self.retry_on
            .as_ref()
            .map_or(true, |codes| codes.contains(&code))
    }

    /// Decide whether `error` should be retried as attempt `attempt`.
    ///
    /// Returns the delay to wait before the attempt when it is allowed.
    pub fn next_delay(&self, error: &TaskError, attempt: u32) -> Option<Duration> {
        if !error.retryable || !self.is_code_eligible(error.code) {
            return None;
        }
        self.is_attempt_permitted(attempt)
            .then(|| self.delay_for_attempt(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_on: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay_ms, 1000);
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
        assert!(policy.retry_on.is_none());
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.is_attempt_permitted(1));
    }

    #[test]
    fn test_attempt_permitted() {
        let policy = RetryPolicy::exponential(3, 100, None);
        assert!(!policy.is_attempt_permitted(0));
        assert!(policy.is_attempt_permitted(1));
        assert!(policy.is_attempt_permitted(3));
        assert!(!policy.is_attempt_permitted(4));
    }

    #[rstest]
    #[case(1, 1000)]
    #[case(2, 2000)]
    #[case(3, 4000)]
    #[case(4, 8000)]
    #[case(5, 10_000)]
    #[case(9, 10_000)]
    fn test_exponential_delay_is_capped(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy::exponential(10, 1000, Some(10_000));
        assert_eq!(
            policy.delay_for_attempt(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_exponential_without_cap_saturates() {
        let policy = RetryPolicy::exponential(10, 1000, None);
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        // Absurd attempt numbers must not panic.
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_fixed_delay_never_changes() {
        let policy = RetryPolicy::fixed(5, 750);
        for attempt in 1..=5 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(750));
        }
    }

    #[test]
    fn test_validate_bounds() {
        assert!(RetryPolicy::exponential(10, 100, None).validate().is_ok());
        assert!(RetryPolicy::exponential(11, 100, None).validate().is_err());
        assert!(RetryPolicy::exponential(3, 500, Some(100)).validate().is_err());
    }

    #[test]
    fn test_next_delay_respects_classification() {
        let policy = RetryPolicy::exponential(2, 100, None);
        let transient = TaskError::new(ErrorCode::Timeout, "timed out");
        let fatal = TaskError::new(ErrorCode::PermissionDenied, "denied");

        assert_eq!(
            policy.next_delay(&transient, 1),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            policy.next_delay(&transient, 2),
            Some(Duration::from_millis(200))
        );
        assert_eq!(policy.next_delay(&transient, 3), None);
        assert_eq!(policy.next_delay(&fatal, 1), None);
    }

    #[test]
    fn test_retry_on_restricts_codes() {
        let policy = RetryPolicy::exponential(3, 10, None).with_retry_on([ErrorCode::Timeout]);
        let timeout = TaskError::new(ErrorCode::Timeout, "slow");
        let refused = TaskError::new(ErrorCode::ConnectionRefused, "refused");

        assert!(policy.next_delay(&timeout, 1).is_some());
        assert!(policy.next_delay(&refused, 1).is_none());
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::fixed(2, 500).with_retry_on([ErrorCode::HttpError]);
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"fixed\""));
        assert!(json.contains("HTTP_ERROR"));
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }
}
