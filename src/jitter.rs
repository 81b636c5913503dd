//! Jitter to prevent thundering herds on retry.

use rand::Rng;
use std::time::Duration;

/// Jitter applied to a computed retry delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter: use the exact scheduled delay.
    None,
    /// Spread the delay by ±`fraction` (0.0 ..= 1.0) of itself.
    Spread { fraction: f64 },
}

impl Jitter {
    /// Jitter by ±`fraction` of the delay. Values are clamped to [0, 1].
    pub fn spread(fraction: f64) -> Self {
        Jitter::Spread { fraction: fraction.clamp(0.0, 1.0) }
    }

    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (for deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Spread { fraction } => {
                let millis = delay.as_millis() as u64;
                let band = (millis as f64 * fraction) as u64;
                if band == 0 {
                    return delay;
                }
                let low = millis.saturating_sub(band);
                let high = millis.saturating_add(band);
                Duration::from_millis(rng.random_range(low..=high))
            }
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::None
    }
}
