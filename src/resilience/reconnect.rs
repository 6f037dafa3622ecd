//! Bounded fixed-delay retry schedule for re-dialing the broker.

use std::time::Duration;

use crate::constants::defaults;

/// How many times to re-dial after an unexpected close, and how long to wait
/// between failed attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Attempt numbers, starting at 1
    pub fn attempts(&self) -> impl Iterator<Item = u32> {
        1..=self.max_attempts
    }

    pub fn is_last_attempt(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            defaults::MAX_RECONNECT_ATTEMPTS,
            Duration::from_secs(defaults::RECONNECT_DELAY_SECONDS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_attempts_are_bounded() {
        let policy = ReconnectPolicy::new(3, Duration::from_millis(10));
        let attempts: Vec<u32> = policy.attempts().collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(!policy.is_last_attempt(2));
        assert!(policy.is_last_attempt(3));
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let policy = ReconnectPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.attempts().count(), 0);
    }
}
