//! Clock and warm-up gating of chaos evaluation

use super::{CategoryStates, CycleState};
use std::time::{Duration, Instant};

/// Whether a new evaluation tick is due at `now`
pub fn tick_due(last_tick: Option<Instant>, now: Instant, interval: Duration) -> bool {
    match last_tick {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= interval,
    }
}

impl CycleState {
    /// Claims the tick at `now` if one is due.
    ///
    /// Callers hold the chaos state lock, so at most one request claims any
    /// given tick.
    pub fn try_advance_tick(&mut self, now: Instant, interval: Duration) -> bool {
        if !tick_due(self.last_tick, now, interval) {
            return false;
        }
        self.last_tick = Some(now);
        true
    }

    /// Instant at which the current cycle's initial delay is over, `None`
    /// when it lies beyond what `Instant` can represent
    pub fn ready_at(&self) -> Option<Instant> {
        self.origin.checked_add(self.initial_delay)
    }

    /// Whether the server is still pausing after a forced crash
    pub fn is_restarting(&self, now: Instant) -> bool {
        now < self.origin
    }

    /// Whether selection may run, i.e. warm-up started at least
    /// `stabilization` ago
    pub fn is_stabilized(&self, now: Instant, stabilization: Duration) -> bool {
        self.warmup_started_at
            .map(|at| now.saturating_duration_since(at) >= stabilization)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupStatus {
    /// The initial delay has not elapsed yet
    Initializing { remaining: Duration },
    /// Warm-up was activated on this tick; no chaos runs until the next one
    Started,
    /// Warm-up is complete, chaos logic may run
    Ready,
}

/// Runs the warm-up gate for a due tick
pub fn warm_up(cycle: &mut CycleState, categories: &mut CategoryStates, now: Instant) -> WarmupStatus {
    if cycle.warmup_started {
        return WarmupStatus::Ready;
    }

    match cycle.ready_at() {
        Some(ready_at) if now >= ready_at => {}
        Some(ready_at) => {
            return WarmupStatus::Initializing {
                remaining: ready_at - now,
            }
        }
        None => {
            return WarmupStatus::Initializing {
                remaining: cycle
                    .origin
                    .saturating_duration_since(now)
                    .saturating_add(cycle.initial_delay),
            }
        }
    }

    cycle.warmup_started = true;
    cycle.warmup_started_at = Some(now);
    for state in categories.iter_mut() {
        state.activated_at = Some(now);
    }
    WarmupStatus::Started
}
