//! Reconnect backoff schedule.

use std::time::Duration;

/// Linear backoff with an upper bound: `min(cap, step * attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    step: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    /// Policy adding `step` per attempt, never exceeding `cap`.
    pub fn new(step: Duration, cap: Duration) -> Self {
        Self { step, cap }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.cap)
    }

    /// Per-attempt increment.
    pub fn step(&self) -> Duration {
        self.step
    }

    /// Largest delay ever returned.
    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(5), Duration::from_secs(5));
        assert_eq!(policy.delay(30), Duration::from_secs(30));
        assert_eq!(policy.delay(31), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_non_decreasing() {
        let policy = BackoffPolicy::new(Duration::from_millis(700), Duration::from_secs(10));
        let mut last = Duration::ZERO;
        for attempt in 0..100 {
            let d = policy.delay(attempt);
            assert!(d >= last);
            assert!(d <= policy.cap());
            last = d;
        }
    }
}
