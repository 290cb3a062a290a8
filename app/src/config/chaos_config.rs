use super::{ConfigError, Validate};
use crate::chaos::CrashCategory;
use rand::Rng;
use std::time::Duration;

/// Asymptotic multiplier applied to a category's base chance once its
/// buildup window is complete.
pub const DEFAULT_AMPLIFICATION: f64 = 6.0;

pub const DEFAULT_HIGH_CPU_CHANCE: f64 = 0.05;
pub const DEFAULT_MEMORY_LEAK_CHANCE: f64 = 0.03;
pub const DEFAULT_NETWORK_DELAY_CHANCE: f64 = 0.06;
pub const DEFAULT_RESOURCE_EXHAUSTION_CHANCE: f64 = 0.04;

pub const DEFAULT_BUILDUP_DURATION: Duration = Duration::from_secs(35 * 60);
pub const DEFAULT_CRASH_WINDOW: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_INITIAL_DELAY_MIN: Duration = Duration::ZERO;
pub const DEFAULT_INITIAL_DELAY_MAX: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STABILIZATION_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_RESTART_PAUSE: Duration = Duration::from_secs(2);

/// Upper bound for every configured duration
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// Injector caps. Chosen to keep a development machine responsive.
pub const MAX_CPU_ITERATIONS: u64 = 1_000_000;
pub const MAX_MEMORY_CHUNK_BYTES: usize = 1024 * 1024;
pub const MAX_NETWORK_DELAY: Duration = Duration::from_millis(500);
pub const MAX_RESOURCE_HOLDERS: usize = 10;
pub const RESOURCE_HOLD_DURATION: Duration = Duration::from_secs(2);

/// Base per-tick trigger chance of every crash category
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryChances {
    pub high_cpu_load: f64,
    pub memory_leak: f64,
    pub network_delay: f64,
    pub resource_exhaustion: f64,
}

impl CategoryChances {
    pub fn new(
        high_cpu_load: f64,
        memory_leak: f64,
        network_delay: f64,
        resource_exhaustion: f64,
    ) -> Self {
        Self {
            high_cpu_load,
            memory_leak,
            network_delay,
            resource_exhaustion,
        }
    }

    /// Chances that never select any category
    pub fn disabled() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }

    pub fn get(&self, category: CrashCategory) -> f64 {
        match category {
            CrashCategory::HighCpuLoad => self.high_cpu_load,
            CrashCategory::MemoryLeak => self.memory_leak,
            CrashCategory::NetworkDelay => self.network_delay,
            CrashCategory::ResourceExhaustion => self.resource_exhaustion,
        }
    }

    pub fn total(&self) -> f64 {
        self.high_cpu_load + self.memory_leak + self.network_delay + self.resource_exhaustion
    }
}

impl Default for CategoryChances {
    fn default() -> Self {
        Self::new(
            DEFAULT_HIGH_CPU_CHANCE,
            DEFAULT_MEMORY_LEAK_CHANCE,
            DEFAULT_NETWORK_DELAY_CHANCE,
            DEFAULT_RESOURCE_EXHAUSTION_CHANCE,
        )
    }
}

/// Hard caps on the severity of each failure injector, reached at full progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InjectorLimits {
    pub cpu_iterations: u64,
    pub memory_chunk_bytes: usize,
    pub network_delay: Duration,
    pub resource_holders: usize,
    pub resource_hold: Duration,
}

impl Default for InjectorLimits {
    fn default() -> Self {
        Self {
            cpu_iterations: MAX_CPU_ITERATIONS,
            memory_chunk_bytes: MAX_MEMORY_CHUNK_BYTES,
            network_delay: MAX_NETWORK_DELAY,
            resource_holders: MAX_RESOURCE_HOLDERS,
            resource_hold: RESOURCE_HOLD_DURATION,
        }
    }
}

/// Chaos configuration, immutable once the supervisor is built
#[derive(Debug, Clone, PartialEq)]
pub struct ChaosConfig {
    pub chances: CategoryChances,

    /// Time for a category to ramp from zero to full intensity
    pub buildup_duration: Duration,

    /// Extra time after the buildup before a forced crash becomes possible
    pub crash_window: Duration,

    /// Inclusive bounds the initial delay of every cycle is drawn from
    pub initial_delay_min: Duration,
    pub initial_delay_max: Duration,

    /// Minimum spacing between two evaluations of the state machine
    pub tick_interval: Duration,

    /// Quiet period after warm-up before a category may be selected
    pub stabilization_delay: Duration,

    /// Pause between a forced crash and the next warm-up
    pub restart_pause: Duration,

    pub amplification: f64,

    pub limits: InjectorLimits,

    /// Seed for deterministic chaos draws
    pub seed: Option<u64>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            chances: CategoryChances::default(),
            buildup_duration: DEFAULT_BUILDUP_DURATION,
            crash_window: DEFAULT_CRASH_WINDOW,
            initial_delay_min: DEFAULT_INITIAL_DELAY_MIN,
            initial_delay_max: DEFAULT_INITIAL_DELAY_MAX,
            tick_interval: DEFAULT_TICK_INTERVAL,
            stabilization_delay: DEFAULT_STABILIZATION_DELAY,
            restart_pause: DEFAULT_RESTART_PAUSE,
            amplification: DEFAULT_AMPLIFICATION,
            limits: InjectorLimits::default(),
            seed: None,
        }
    }
}

impl ChaosConfig {
    /// Elapsed activation time past which a trigger becomes a forced crash
    pub fn crash_threshold(&self) -> Duration {
        self.buildup_duration.saturating_add(self.crash_window)
    }

    pub fn draw_initial_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.initial_delay_max <= self.initial_delay_min {
            return self.initial_delay_min;
        }
        rng.gen_range(self.initial_delay_min..=self.initial_delay_max)
    }
}

impl Validate for ChaosConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, chance) in [
            ("high_cpu_chance", self.chances.high_cpu_load),
            ("memory_leak_chance", self.chances.memory_leak),
            ("network_delay_chance", self.chances.network_delay),
            ("resource_exhaustion_chance", self.chances.resource_exhaustion),
        ] {
            if !chance.is_finite() || chance < 0.0 {
                return Err(ConfigError::invalid(
                    field,
                    format!("chance must be a finite non-negative number, got {chance}"),
                ));
            }
        }

        for (field, duration) in [
            ("buildup_duration", self.buildup_duration),
            ("crash_window", self.crash_window),
            ("initial_delay_min", self.initial_delay_min),
            ("initial_delay_max", self.initial_delay_max),
            ("tick_interval", self.tick_interval),
            ("stabilization_delay", self.stabilization_delay),
            ("restart_pause", self.restart_pause),
        ] {
            if duration > MAX_CONFIG_DURATION {
                return Err(ConfigError::invalid(
                    field,
                    format!("{duration:?} exceeds the maximum of {MAX_CONFIG_DURATION:?}"),
                ));
            }
        }

        if self.initial_delay_min > self.initial_delay_max {
            return Err(ConfigError::invalid(
                "initial_delay_range",
                format!(
                    "minimum {:?} exceeds maximum {:?}",
                    self.initial_delay_min, self.initial_delay_max
                ),
            ));
        }

        if self.tick_interval.is_zero() {
            return Err(ConfigError::invalid(
                "tick_interval",
                "tick interval must be greater than zero",
            ));
        }

        if !self.amplification.is_finite() || self.amplification <= 0.0 {
            return Err(ConfigError::invalid(
                "amplification",
                format!("amplification must be positive, got {}", self.amplification),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_config_is_valid() {
        let config = ChaosConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crash_threshold(), Duration::from_secs(45 * 60));
        assert!((config.chances.total() - 0.18).abs() < 1e-9);
    }

    #[test]
    fn rejects_negative_chance() {
        let config = ChaosConfig {
            chances: CategoryChances::new(0.05, -0.01, 0.06, 0.04),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(
            err,
            ConfigError::invalid(
                "memory_leak_chance",
                "chance must be a finite non-negative number, got -0.01"
            )
        );
    }

    #[test]
    fn rejects_inverted_delay_range_and_zero_tick() {
        let inverted = ChaosConfig {
            initial_delay_min: Duration::from_secs(10),
            initial_delay_max: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let zero_tick = ChaosConfig {
            tick_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_tick.validate().is_err());

        let flat = ChaosConfig {
            amplification: 0.0,
            ..Default::default()
        };
        assert!(flat.validate().is_err());
    }

    #[test]
    fn rejects_durations_beyond_a_year() {
        let huge = Duration::from_secs(u64::MAX);
        let delay = ChaosConfig {
            initial_delay_min: huge,
            initial_delay_max: huge,
            ..Default::default()
        };
        assert!(matches!(
            delay.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "initial_delay_min"
        ));

        let pause = ChaosConfig {
            restart_pause: huge,
            ..Default::default()
        };
        assert!(pause.validate().is_err());

        let edge = ChaosConfig {
            buildup_duration: MAX_CONFIG_DURATION,
            ..Default::default()
        };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn initial_delay_stays_in_range() {
        let config = ChaosConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let delay = config.draw_initial_delay(&mut rng);
            assert!(delay <= DEFAULT_INITIAL_DELAY_MAX);
        }

        let fixed = ChaosConfig {
            initial_delay_min: Duration::from_secs(5),
            initial_delay_max: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(fixed.draw_initial_delay(&mut rng), Duration::from_secs(5));
    }
}
