use std::time::Duration;

use extdev_core::ReloadConfig;

/// Bounded exponential reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    pub fn from_config(config: &ReloadConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.max_reconnect_attempts,
        )
    }

    /// `min(max, base * 2^attempt)`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Given the attempts already made, the next attempt number and its
    /// delay, or `None` once the budget is spent.
    pub fn next(&self, attempts_so_far: u32) -> Option<(u32, Duration)> {
        if attempts_so_far >= self.max_attempts {
            return None;
        }
        let attempt = attempts_so_far + 1;
        Some((attempt, self.delay_for(attempt)))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReloadConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = ReconnectPolicy::default();
        let mut attempts = 0;
        let mut delays = Vec::new();
        while let Some((attempt, delay)) = policy.next(attempts) {
            attempts = attempt;
            delays.push(delay.as_millis() as u64);
        }
        assert_eq!(
            delays,
            vec![500, 1000, 2000, 4000, 5000, 5000, 5000, 5000, 5000, 5000]
        );
        assert_eq!(attempts, 10);
        assert!(policy.next(10).is_none());
    }

    #[test]
    fn test_large_attempts_saturate() {
        let policy = ReconnectPolicy::new(Duration::from_millis(250), Duration::from_secs(5), 100);
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_budget() {
        let policy = ReconnectPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 0);
        assert!(policy.next(0).is_none());
    }
}
