//! Read-only view of the chaos state

use super::{ChaosState, CrashCategory};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use strum::{Display, IntoEnumIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CyclePhase {
    /// Pausing after a forced crash
    Resetting,
    /// Waiting for the initial delay to elapse
    WarmingUp,
    /// Warm, no category active
    Idle,
    /// A category is building up
    Buildup,
}

/// Snapshot of the chaos state at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub phase: CyclePhase,
    pub category: Option<CrashCategory>,
    /// Time since the active category's activation
    pub uptime: Option<Duration>,
    pub trigger_counts: Vec<(CrashCategory, u64)>,
    pub generation: u64,
    pub memory_bytes: usize,
    pub background_tasks: usize,
}

impl StatusReport {
    pub fn capture(state: &ChaosState, now: Instant) -> Self {
        let cycle = &state.cycle;
        let phase = if cycle.active.is_some() {
            CyclePhase::Buildup
        } else if cycle.is_restarting(now) {
            CyclePhase::Resetting
        } else if !cycle.warmup_started {
            CyclePhase::WarmingUp
        } else {
            CyclePhase::Idle
        };

        Self {
            phase,
            category: cycle.active,
            uptime: cycle.active.map(|c| state.categories[c].elapsed(now)),
            trigger_counts: CrashCategory::iter()
                .map(|c| (c, state.categories[c].trigger_count))
                .collect(),
            generation: cycle.generation,
            memory_bytes: 0,
            background_tasks: 0,
        }
    }

    pub fn with_resources(mut self, memory_bytes: usize, background_tasks: usize) -> Self {
        self.memory_bytes = memory_bytes;
        self.background_tasks = background_tasks;
        self
    }

    fn chaos_summary(&self) -> String {
        match (self.category, self.uptime) {
            (Some(category), Some(uptime)) => {
                format!("Chaos Type: {category}, Uptime: {uptime:?}")
            }
            _ => "No chaos active".to_string(),
        }
    }

    /// Body of a healthy `/` response
    pub fn running_message(&self) -> String {
        format!("Server is running... ({})", self.chaos_summary())
    }

    /// Body of a `/health` response
    pub fn health_message(&self) -> String {
        format!("Health check: OK ({})", self.chaos_summary())
    }

    pub fn to_json(&self) -> Value {
        let trigger_counts: serde_json::Map<String, Value> = self
            .trigger_counts
            .iter()
            .map(|(category, count)| (category.to_string(), json!(count)))
            .collect();

        json!({
            "phase": self.phase.to_string(),
            "category": self.category.map(|c| c.to_string()),
            "uptime_secs": self.uptime.map(|u| u.as_secs_f64()),
            "trigger_counts": trigger_counts,
            "generation": self.generation,
            "memory_bytes": self.memory_bytes,
            "background_tasks": self.background_tasks,
        })
    }
}
