//! Attempt budget and backoff schedule

use std::time::Duration;

use crate::config::SyncConfig;
use crate::models::MAX_ATTEMPTS;

/// How many times an operation may be attempted and how long to wait between
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    /// `max_attempts` is capped at [`MAX_ATTEMPTS`]; an empty schedule means no delay
    pub fn new(max_attempts: u32, schedule: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS),
            schedule,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.max_attempts,
            config
                .backoff_schedule_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        )
    }

    /// Retry immediately; for tests and manual drains
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Vec::new())
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay after the `attempts`-th failure; the last entry repeats
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let index = usize::try_from(attempts.saturating_sub(1)).unwrap_or(usize::MAX);
        self.schedule
            .get(index)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_indexed_by_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(5));
        assert_eq!(policy.delay_after(3), Duration::from_secs(30));
        assert_eq!(policy.delay_after(4), Duration::from_secs(120));
        assert_eq!(policy.delay_after(5), Duration::from_secs(600));
        assert_eq!(policy.delay_after(12), Duration::from_secs(600));
    }

    #[test]
    fn delays_never_decrease() {
        let policy = RetryPolicy::default();
        let delays = (1..=8).map(|n| policy.delay_after(n)).collect::<Vec<_>>();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn budget_is_capped() {
        let policy = RetryPolicy::new(50, Vec::new());
        assert_eq!(policy.max_attempts(), MAX_ATTEMPTS);
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }

    #[test]
    fn immediate_policy_has_no_delay() {
        assert_eq!(RetryPolicy::immediate(3).delay_after(2), Duration::ZERO);
    }
}
