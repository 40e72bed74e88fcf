//! Retry policy
//!
//! Pure delay calculation — no state, no I/O, no randomness. The policy is
//! captured into the task row at schedule time, so each row is self-contained.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration for a task's retries.
///
/// Two shapes:
/// - fixed: every retry waits `max_backoff`;
/// - exponential: retry `n` waits `min(base^n * 1s, max_backoff)`.
///
/// # Example
///
/// ```
/// use deferq::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(2.0, 5, Duration::from_secs(10));
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
/// // Capped at max_backoff
/// assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Whether the delay grows exponentially with the attempt number
    pub exponential: bool,

    /// Exponent base for exponential backoff (ignored when fixed)
    pub base: f64,

    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay ceiling; also the constant delay for fixed backoff
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff — the schedule-time default.
    pub fn no_retry() -> Self {
        Self {
            exponential: false,
            base: 0.0,
            max_attempts: 1,
            max_backoff: Duration::ZERO,
        }
    }

    /// Constant delay between attempts.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            exponential: false,
            base: 0.0,
            max_attempts: max_attempts.max(1),
            max_backoff: delay,
        }
    }

    /// Exponentially growing delay, capped at `max_backoff`.
    pub fn exponential(base: f64, max_attempts: u32, max_backoff: Duration) -> Self {
        Self {
            exponential: true,
            base,
            max_attempts: max_attempts.max(1),
            max_backoff,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay ceiling
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Delay to wait before the next attempt.
    ///
    /// `attempt` is the 1-based count of attempts already made, so the first
    /// retry passes `attempt = 1`. Huge exponents saturate at `max_backoff`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.max_backoff;
        }

        let millis = self.base.powi(attempt.min(i32::MAX as u32) as i32) * 1000.0;
        if !millis.is_finite() || millis < 0.0 || millis >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }

        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    /// Whether `current_attempt` attempts leave room for another.
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_retry_defaults() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.exponential);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_fixed_delay_ignores_attempt_number() {
        let policy = RetryPolicy::fixed(Duration::from_millis(5000), 3);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(99), Duration::from_millis(5000));
    }

    #[test]
    fn test_exponential_delay_formula() {
        let policy = RetryPolicy::exponential(2.0, 5, Duration::from_millis(10_000));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8000));
        // 2^4 * 1000 = 16000ms, capped
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(10_000));
    }

    #[test]
    fn test_huge_exponent_saturates() {
        let policy = RetryPolicy::exponential(10.0, 1000, Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_degenerate_base_accepted() {
        // base <= 1.0 with exponential backoff is a non-growing delay, not an error
        let policy = RetryPolicy::exponential(1.0, 3, Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));

        let shrinking = RetryPolicy::exponential(0.5, 3, Duration::from_secs(30));
        assert_eq!(shrinking.delay_for_attempt(1), Duration::from_millis(500));
    }

    #[test]
    fn test_attempts_remaining() {
        let policy = RetryPolicy::fixed(Duration::ZERO, 3);

        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_serialization_round_trip() {
        let policy = RetryPolicy::exponential(2.5, 4, Duration::from_millis(12_345));

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }
}
