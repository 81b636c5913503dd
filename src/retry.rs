//! Retry delay scheduling.
//!
//! Pure computation: given a strategy, a base wait and a 1-indexed attempt
//! number, produce the delay before the next attempt. Jitter and the
//! per-call ceiling are applied on top.

use crate::Jitter;
use rand::Rng;
use std::time::Duration;

/// Hard ceiling on any single retry delay when no explicit ceiling is set.
pub const MAX_ALLOWED_WAIT: Duration = Duration::from_millis(60_000);

/// Retry delay strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RetryStrategy {
    /// Same delay between every attempt.
    Fixed,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Delay doubles with every attempt.
    Exponential,
}

/// Schedule combining strategy, base wait, jitter and a delay ceiling.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub strategy: RetryStrategy,
    pub wait: Duration,
    pub jitter: Jitter,
    pub max_allowed_wait: Duration,
}

impl RetrySchedule {
    pub fn new(strategy: RetryStrategy, wait: Duration) -> Self {
        Self { strategy, wait, jitter: Jitter::None, max_allowed_wait: MAX_ALLOWED_WAIT }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_allowed_wait(mut self, max: Duration) -> Self {
        self.max_allowed_wait = max;
        self
    }

    /// Raw delay for a 1-indexed attempt, before jitter and clamping.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Fixed => self.wait,
            RetryStrategy::Linear => {
                self.wait.checked_mul(attempt).unwrap_or(Duration::from_secs(u64::MAX))
            }
            RetryStrategy::Exponential => {
                let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.wait.checked_mul(multiplier).unwrap_or(Duration::from_secs(u64::MAX))
            }
        }
    }

    /// Jittered, clamped delay for a 1-indexed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Same as [`delay`](Self::delay) with a caller-supplied RNG.
    pub fn delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        self.jitter.apply_with_rng(self.base_delay(attempt), rng).min(self.max_allowed_wait)
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(RetryStrategy::Fixed, Duration::from_millis(1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_returns_same_delay() {
        let schedule = RetrySchedule::new(RetryStrategy::Fixed, Duration::from_millis(100));
        assert_eq!(schedule.base_delay(1), Duration::from_millis(100));
        assert_eq!(schedule.base_delay(2), Duration::from_millis(100));
        assert_eq!(schedule.base_delay(100), Duration::from_millis(100));
    }

    #[test]
    fn linear_scales_with_attempt() {
        let schedule = RetrySchedule::new(RetryStrategy::Linear, Duration::from_millis(100));
        assert_eq!(schedule.base_delay(1), Duration::from_millis(100));
        assert_eq!(schedule.base_delay(2), Duration::from_millis(200));
        assert_eq!(schedule.base_delay(3), Duration::from_millis(300));
        assert_eq!(schedule.base_delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn exponential_doubles_each_attempt() {
        let schedule = RetrySchedule::new(RetryStrategy::Exponential, Duration::from_millis(100));
        assert_eq!(schedule.base_delay(1), Duration::from_millis(100)); // 100 * 2^0
        assert_eq!(schedule.base_delay(2), Duration::from_millis(200)); // 100 * 2^1
        assert_eq!(schedule.base_delay(3), Duration::from_millis(400)); // 100 * 2^2
        assert_eq!(schedule.base_delay(5), Duration::from_millis(1600));
    }

    #[test]
    fn delay_clamps_to_max_allowed_wait() {
        let schedule = RetrySchedule::new(RetryStrategy::Exponential, Duration::from_secs(30));
        assert_eq!(schedule.delay(10), MAX_ALLOWED_WAIT);

        let schedule = schedule.with_max_allowed_wait(Duration::from_secs(5));
        assert_eq!(schedule.delay(10), Duration::from_secs(5));
    }

    #[test]
    fn exponential_saturates_on_overflow() {
        let schedule = RetrySchedule::new(RetryStrategy::Exponential, Duration::from_secs(1))
            .with_max_allowed_wait(Duration::from_secs(u64::MAX));
        // Attempt 64 would overflow u32; saturates instead of panicking.
        assert!(schedule.base_delay(64) > Duration::from_secs(1_000_000));
    }

    #[test]
    fn linear_saturates_on_overflow() {
        let schedule =
            RetrySchedule::new(RetryStrategy::Linear, Duration::from_secs(u64::MAX / 2));
        assert!(schedule.base_delay(10) >= Duration::from_secs(u64::MAX / 2));
    }

    #[test]
    fn jitter_applied_within_band() {
        let schedule = RetrySchedule::new(RetryStrategy::Fixed, Duration::from_millis(1000))
            .with_jitter(Jitter::spread(0.1));
        for _ in 0..50 {
            let d = schedule.delay(1);
            assert!(d >= Duration::from_millis(900) && d <= Duration::from_millis(1100));
        }
    }
}
