//! Buildup progress and per-tick trigger probability

use super::CategoryState;
use rand::Rng;
use std::time::Duration;

/// Fraction of the buildup window that has elapsed, clamped to `[0, 1]`.
/// An empty buildup window counts as complete.
pub fn progress(elapsed: Duration, buildup: Duration) -> f64 {
    if buildup.is_zero() {
        return 1.0;
    }
    (elapsed.as_secs_f64() / buildup.as_secs_f64()).clamp(0.0, 1.0)
}

/// Trigger probability for one tick, in `[0, base * amplification]`
pub fn effective_chance(base: f64, progress: f64, amplification: f64) -> f64 {
    base * progress.clamp(0.0, 1.0) * amplification
}

/// Intensity of the active category on one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intensity {
    pub elapsed: Duration,
    pub progress: f64,
    pub effective_chance: f64,
}

impl Intensity {
    pub fn measure(elapsed: Duration, buildup: Duration, base: f64, amplification: f64) -> Self {
        let progress = progress(elapsed, buildup);
        Self {
            elapsed,
            progress,
            effective_chance: effective_chance(base, progress, amplification),
        }
    }

    /// A category fires unconditionally the first time it is evaluated,
    /// probabilistically afterwards.
    pub fn should_trigger<R: Rng + ?Sized>(&self, state: &CategoryState, rng: &mut R) -> bool {
        !state.has_triggered || rng.gen::<f64>() < self.effective_chance
    }
}
