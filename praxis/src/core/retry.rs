use std::time::Duration;

/// Backoff schedule for [`Promise::retry`](crate::Promise::retry).
///
/// Only errors for which [`Retryable::is_retryable`](crate::Retryable) returns
/// true are retried. Each retry re-subscribes the original promise, so the
/// producer runs again from scratch.
///
/// # Examples
///
/// ```
/// use praxis::RetryPolicy;
/// use std::time::Duration;
///
/// const API_RETRY: RetryPolicy = RetryPolicy {
///     max_attempts: 5,
///     initial_delay: Duration::from_millis(50),
///     max_delay: Duration::from_secs(2),
///     backoff_multiplier: 2.0,
/// };
///
/// assert_eq!(API_RETRY.delay_for_attempt(1), Some(Duration::from_millis(50)));
/// assert_eq!(API_RETRY.delay_for_attempt(5), None);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of subscriptions, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap for the exponential backoff.
    pub max_delay: Duration,

    /// Each retry delay is `min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// No retries; the first error is final.
    pub const NONE: Self = Self {
        max_attempts: 1,
        initial_delay: Duration::from_secs(0),
        max_delay: Duration::from_secs(0),
        backoff_multiplier: 1.0,
    };

    /// Three attempts: immediate, then 1s, then 2s.
    pub const STANDARD: Self = Self {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    /// Ten attempts starting at 100ms, growing 1.5x, capped at 10s.
    pub const AGGRESSIVE: Self = Self {
        max_attempts: 10,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
        backoff_multiplier: 1.5,
    };

    /// Standard delays with a custom attempt count.
    pub const fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed), or
    /// `None` once the attempts are used up.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let exponent = attempt.saturating_sub(1) as f64;
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powf(exponent);
        Some(Duration::from_secs_f64(
            delay_secs.min(self.max_delay.as_secs_f64()),
        ))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<u32> for RetryPolicy {
    fn from(max_attempts: u32) -> Self {
        Self::with_max_attempts(max_attempts)
    }
}
