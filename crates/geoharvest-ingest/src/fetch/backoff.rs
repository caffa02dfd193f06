use std::time::Duration;

/// Retry schedule: `base_delay * multiplier^k` before retry `k` (0-indexed)
///
/// No jitter and no cap. With the defaults the last wait before giving up is
/// 256 seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt `attempt` (0-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor)
    }

    /// Delay before the next attempt, or `None` once the budget is spent
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt + 1 < self.max_attempts).then(|| self.delay_for(attempt))
    }

    /// Every wait a fully failing request goes through, in order
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map_while(|attempt| self.next_delay(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_from_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_no_wait_after_final_attempt() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(8), Some(Duration::from_secs(256)));
        assert_eq!(policy.next_delay(9), None);

        let schedule: Vec<_> = policy.schedule().collect();
        assert_eq!(schedule.len(), 9);
        assert_eq!(schedule.last(), Some(&Duration::from_secs(256)));
    }

    #[test]
    fn test_single_attempt_never_waits() {
        let policy = BackoffPolicy::new(1, Duration::from_millis(5));
        assert_eq!(policy.schedule().count(), 0);
    }

    #[test]
    fn test_huge_exponent_saturates() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(200), Duration::from_secs(u64::from(u32::MAX)));
    }
}
