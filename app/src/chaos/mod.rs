//! Chaos state machine
//!
//! Once warmed up, the supervisor picks one crash category, ramps its failure
//! intensity over the buildup window, forces a hard crash once the crash
//! window has passed, and then starts a new cycle. All chaos state lives in a
//! single [`ChaosState`] owned by the [`supervisor::ChaosSupervisor`].

pub mod gate;
pub mod injector;
pub mod intensity;
pub mod selector;
pub mod status;
pub mod supervisor;

pub use injector::{BackgroundWork, FailureInjector, InjectionEffect, InjectorSet};
pub use status::{CyclePhase, StatusReport};
pub use supervisor::{ChaosOutcome, ChaosSupervisor};

use rand::rngs::StdRng;
use std::ops::{Index, IndexMut};
use std::time::{Duration, Instant};
use strum::{Display, EnumCount, EnumIter, IntoStaticStr};

/// Failure kinds the server can degrade into
///
/// The declaration order is the order of the selector's cumulative intervals.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumCount, IntoStaticStr,
)]
pub enum CrashCategory {
    #[strum(serialize = "HighCPULoad")]
    HighCpuLoad,
    #[strum(serialize = "MemoryLeak")]
    MemoryLeak,
    #[strum(serialize = "NetworkDelay")]
    NetworkDelay,
    #[strum(serialize = "ResourceExhaustion")]
    ResourceExhaustion,
}

impl CrashCategory {
    /// Human readable name used in failure responses
    pub fn description(&self) -> &'static str {
        match self {
            CrashCategory::HighCpuLoad => "High CPU Load",
            CrashCategory::MemoryLeak => "Memory Leak",
            CrashCategory::NetworkDelay => "Network Delay",
            CrashCategory::ResourceExhaustion => "Resource Exhaustion",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Per-category buildup state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryState {
    /// Start of the buildup, `None` while the category was never stamped
    pub activated_at: Option<Instant>,
    pub has_triggered: bool,
    pub trigger_count: u64,
}

impl CategoryState {
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.activated_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default()
    }
}

/// Buildup state of all four categories, indexed by [`CrashCategory`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryStates([CategoryState; CrashCategory::COUNT]);

impl CategoryStates {
    pub fn iter(&self) -> impl Iterator<Item = &CategoryState> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CategoryState> {
        self.0.iter_mut()
    }
}

impl Index<CrashCategory> for CategoryStates {
    type Output = CategoryState;

    fn index(&self, category: CrashCategory) -> &Self::Output {
        &self.0[category.index()]
    }
}

impl IndexMut<CrashCategory> for CategoryStates {
    fn index_mut(&mut self, category: CrashCategory) -> &mut Self::Output {
        &mut self.0[category.index()]
    }
}

/// Cycle-wide state, reset in full after every forced crash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleState {
    pub active: Option<CrashCategory>,
    pub warmup_started: bool,
    pub warmup_started_at: Option<Instant>,
    pub last_tick: Option<Instant>,

    /// Reference point of the initial delay. Lies in the future while the
    /// server pauses after a crash.
    pub origin: Instant,
    pub initial_delay: Duration,

    /// Number of completed cycles
    pub generation: u64,
}

impl CycleState {
    pub fn new(origin: Instant, initial_delay: Duration) -> Self {
        Self {
            active: None,
            warmup_started: false,
            warmup_started_at: None,
            last_tick: None,
            origin,
            initial_delay,
            generation: 0,
        }
    }
}

/// Everything the tick lock guards
#[derive(Debug)]
pub struct ChaosState {
    pub cycle: CycleState,
    pub categories: CategoryStates,
    pub rng: StdRng,
}
