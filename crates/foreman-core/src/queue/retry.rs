//! Retry policy: decides backoff delays and the terminal threshold.

use std::time::Duration;

/// Retry policy for failed attempts.
///
/// Purely a function of `(attempts, max_attempts)` — it carries no external
/// state, so lease reclamation and execution failure route through the same
/// arithmetic. Deterministic (no jitter): successive delays for one task are
/// guaranteed non-decreasing.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Exponential backoff multiplier.
    pub multiplier: f64,

    /// Ceiling on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of completed attempts.
    ///
    /// `delay = base_delay * multiplier^(attempts - 1)`, capped at
    /// `max_delay`. With the defaults: 1s, 2s, 4s, 8s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs).min(self.max_delay)
    }

    /// True when a task that has now completed `attempts` executions must
    /// not run again.
    pub fn is_exhausted(&self, attempts: u32, max_attempts: u32) -> bool {
        attempts >= max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 4)]
    #[case(4, 8)]
    fn exponential_backoff(#[case] attempts: u32, #[case] expected_secs: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(expected_secs));
    }

    #[test]
    fn delays_are_non_decreasing() {
        let policy = RetryPolicy::default();
        let mut last = Duration::ZERO;
        for attempts in 1..=20 {
            let delay = policy.next_delay(attempts);
            assert!(delay >= last);
            last = delay;
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.next_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn exhaustion_is_exact() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(2, 3));
        assert!(policy.is_exhausted(3, 3));
        assert!(policy.is_exhausted(4, 3));
    }
}
