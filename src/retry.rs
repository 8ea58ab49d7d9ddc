//! Capped exponential backoff shared by every reconnecting component.
//!
//! The policy is a plain value with no hidden state: callers track their own
//! attempt counter and ask for the delay belonging to that attempt.

use std::time::Duration;

use thiserror::Error;

/// Default first-attempt delay.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default ceiling for the backoff curve.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default number of attempts before giving up.
const DEFAULT_MAX_ATTEMPTS: u32 = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    /// Attempt numbers start at 1.
    #[error("attempt must be >= 1")]
    InvalidAttempt,
    /// The caller has exhausted the allowed attempts.
    #[error("exceeded max retry attempts ({0})")]
    MaxAttemptsExceeded(u32),
}

/// Exponential backoff policy: `delay(n) = min(max_delay, base_delay * 2^(n-1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Returns the delay for the given attempt (1-based).
    ///
    /// Fails with [`RetryError::MaxAttemptsExceeded`] once `attempt` passes
    /// `max_attempts`, which is how callers learn to stop retrying.
    pub fn delay(&self, attempt: u32) -> Result<Duration, RetryError> {
        if attempt < 1 {
            return Err(RetryError::InvalidAttempt);
        }
        if attempt > self.max_attempts {
            return Err(RetryError::MaxAttemptsExceeded(self.max_attempts));
        }

        // Saturate the shift so large attempt numbers don't overflow before
        // the cap is applied.
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor.min(u32::MAX as u64) as u32)
            .unwrap_or(self.max_delay);
        Ok(delay.min(self.max_delay))
    }

    /// Sleeps for the delay belonging to `attempt`.
    pub async fn wait(&self, attempt: u32) -> Result<(), RetryError> {
        let delay = self.delay(attempt)?;
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1).unwrap(), Duration::from_secs(1));
        assert_eq!(policy.delay(2).unwrap(), Duration::from_secs(2));
        assert_eq!(policy.delay(3).unwrap(), Duration::from_secs(4));
        assert_eq!(policy.delay(6).unwrap(), Duration::from_secs(32));
        // 2^6 = 64 > 60s cap
        assert_eq!(policy.delay(7).unwrap(), Duration::from_secs(60));
        assert_eq!(policy.delay(12).unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_attempt_zero() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Err(RetryError::InvalidAttempt));
    }

    #[test]
    fn fails_past_max_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(13), Err(RetryError::MaxAttemptsExceeded(12)));
    }

    #[test]
    fn custom_policy_respects_overrides() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            max_attempts: 3,
        };
        assert_eq!(policy.delay(1).unwrap(), Duration::from_millis(100));
        assert_eq!(policy.delay(2).unwrap(), Duration::from_millis(200));
        assert_eq!(policy.delay(3).unwrap(), Duration::from_millis(250));
        assert_eq!(policy.delay(4), Err(RetryError::MaxAttemptsExceeded(3)));
    }
}
