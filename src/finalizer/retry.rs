//! Exponential backoff between finalization attempts.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per market, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (0-based):
    /// `min(initial * factor^attempt, max)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = initial_ms * self.factor.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped.round() as u64)
    }

    /// Whether another attempt follows failed attempt `attempt` (0-based).
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Sum of every backoff sleep when all attempts fail.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|i| self.delay_after(i))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(5_000),
            factor: 2.0,
        };
        let delays: Vec<u64> = (0..5).map(|i| policy.delay_after(i).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
    }

    #[test]
    fn test_factor_one_is_constant() {
        let policy = RetryPolicy {
            factor: 1.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_after(0), policy.delay_after(7));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.has_next(0));
        assert!(policy.has_next(1));
        assert!(!policy.has_next(2));
        assert_eq!(policy.total_backoff(), Duration::from_millis(3_000));
    }

    #[test]
    fn test_huge_exponent_saturates_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(5_000), policy.max_delay);
    }
}
