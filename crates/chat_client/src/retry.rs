use std::time::Duration;

use chat_core::RetryConfig;

/// Capped exponential backoff: `min(base * 2^(attempt-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Every delay a call with `attempts` attempts can wait through.
    pub fn schedule(&self, attempts: u32) -> Vec<Duration> {
        (1..attempts.max(1))
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_attempts_wait_one_then_two_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.schedule(3),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<u128> = (1..=6)
            .map(|n| policy.delay_for_attempt(n).as_millis())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000, 5000]);
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(5000));
    }

    #[test]
    fn single_attempt_never_waits() {
        assert!(RetryPolicy::default().schedule(1).is_empty());
        assert!(RetryPolicy::default().schedule(0).is_empty());
    }
}
