//! Bounded retry with exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff.
///
/// Attempt numbers are 1-indexed; the delay before attempt `n + 1` is
/// `min(base * 2^(n-1), max) + jitter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Cap on the computed delay (before jitter).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// A policy that retries immediately. Intended for tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Returns true if another attempt is allowed after `attempt` attempts.
    #[must_use]
    pub const fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff delay to wait after the given failed attempt, without jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }

    /// Sleeps for the backoff after `attempt`, plus a small jitter.
    pub async fn wait(&self, attempt: u32) {
        let delay = self.backoff(attempt);
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::time::sleep(delay + Duration::from_millis(jitter_millis())).await;
    }
}

/// Jitter of 0 to 19 ms taken from the wall clock's sub-second nanos.
fn jitter_millis() -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    u64::from(nanos) % 20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::immediate(3);
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }

    #[tokio::test]
    async fn immediate_policy_does_not_sleep() {
        let started = std::time::Instant::now();
        RetryPolicy::immediate(5).wait(4).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
