use super::gate::{self, WarmupStatus};
use super::injector::{BackgroundWork, InjectionEffect, InjectorSet};
use super::intensity::Intensity;
use super::selector::select_category;
use super::status::StatusReport;
use super::{CategoryState, CategoryStates, ChaosState, CrashCategory, CycleState};
use crate::config::ChaosConfig;
use crate::metrics::{
    CHAOS_ACTIVE_CATEGORY, CHAOS_BACKGROUND_TASKS, CHAOS_CRASHES, CHAOS_CYCLE_RESETS,
    CHAOS_MEMORY_BYTES, CHAOS_TICKS, CHAOS_TRIGGERS,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};
use tracing::*;

/// What a request to `/` should observe
#[derive(Debug, Clone, PartialEq)]
pub enum ChaosOutcome {
    /// The initial delay of the current cycle is still running
    Initializing { remaining: Duration },
    /// Nothing fired on this request
    Healthy(StatusReport),
    /// The active category's injector fired
    Failure {
        category: CrashCategory,
        trigger_count: u64,
        effect: InjectionEffect,
    },
    /// The active category outlived its crash window. The connection must
    /// be dropped without a response; the cycle has already been reset.
    Crash {
        category: CrashCategory,
        trigger_count: u64,
    },
}

enum Decision {
    Done(ChaosOutcome),
    Inject {
        category: CrashCategory,
        trigger_count: u64,
        intensity: Intensity,
    },
}

/// Owner of the chaos state machine
///
/// Request handlers share one supervisor. The due-tick check and every
/// mutation of the cycle and category state happen under a single lock, so
/// concurrent requests within one tick interval never evaluate twice.
#[derive(Debug)]
pub struct ChaosSupervisor {
    config: ChaosConfig,
    state: Mutex<ChaosState>,
    injectors: InjectorSet,
    work: BackgroundWork,
}

impl ChaosSupervisor {
    pub fn new(config: ChaosConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    /// Builds a supervisor whose first cycle starts at `origin`
    pub fn starting_at(config: ChaosConfig, origin: Instant) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let initial_delay = config.draw_initial_delay(&mut rng);
        let injectors = InjectorSet::new(&config.limits);

        Self {
            state: Mutex::new(ChaosState {
                cycle: CycleState::new(origin, initial_delay),
                categories: CategoryStates::default(),
                rng,
            }),
            injectors,
            work: BackgroundWork::new(),
            config,
        }
    }

    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    pub fn injectors(&self) -> &InjectorSet {
        &self.injectors
    }

    pub fn background(&self) -> &BackgroundWork {
        &self.work
    }

    /// Initial delay of the current cycle
    pub fn initial_delay(&self) -> Duration {
        self.state.lock().cycle.initial_delay
    }

    /// Observes the chaos state without changing it
    pub fn status(&self, now: Instant) -> StatusReport {
        let state = self.state.lock();
        self.report(&state, now)
    }

    /// Runs one request through the state machine
    pub async fn tick(&self, now: Instant) -> ChaosOutcome {
        match self.evaluate(now) {
            Decision::Done(outcome) => outcome,
            Decision::Inject {
                category,
                trigger_count,
                intensity,
            } => {
                warn!(
                    %category,
                    trigger_count,
                    elapsed = ?intensity.elapsed,
                    progress = intensity.progress,
                    "{} simulated",
                    category.description()
                );
                // runs outside the tick lock, a network delay only holds this request
                let injector = self.injectors.get(category);
                let effect = injector.inject(intensity.progress, &self.work).await;
                debug!(injector = %injector.category(), ?effect, "Injection applied");

                CHAOS_TICKS.with_label_values(&["triggered"]).inc();
                CHAOS_TRIGGERS.with_label_values(&[category.into()]).inc();
                CHAOS_MEMORY_BYTES.set(self.injectors.memory.len() as i64);
                CHAOS_BACKGROUND_TASKS.set(self.work.live_tasks() as i64);

                ChaosOutcome::Failure {
                    category,
                    trigger_count,
                    effect,
                }
            }
        }
    }

    fn evaluate(&self, now: Instant) -> Decision {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.cycle.try_advance_tick(now, self.config.tick_interval) {
            return self.healthy(state, now);
        }

        match gate::warm_up(&mut state.cycle, &mut state.categories, now) {
            WarmupStatus::Initializing { remaining } => {
                CHAOS_TICKS.with_label_values(&["initializing"]).inc();
                return Decision::Done(ChaosOutcome::Initializing { remaining });
            }
            WarmupStatus::Started => {
                info!(
                    generation = state.cycle.generation,
                    "Chaos initialization started after initial delay"
                );
                CHAOS_TICKS.with_label_values(&["warmup_started"]).inc();
                return self.healthy(state, now);
            }
            WarmupStatus::Ready => {}
        }

        if state.cycle.active.is_none()
            && state
                .cycle
                .is_stabilized(now, self.config.stabilization_delay)
        {
            self.select(state, now);
        }

        let Some(category) = state.cycle.active else {
            CHAOS_TICKS.with_label_values(&["healthy"]).inc();
            return self.healthy(state, now);
        };

        let current = state.categories[category];
        let intensity = Intensity::measure(
            current.elapsed(now),
            self.config.buildup_duration,
            self.config.chances.get(category),
            self.config.amplification,
        );
        if !intensity.should_trigger(&current, &mut state.rng) {
            CHAOS_TICKS.with_label_values(&["healthy"]).inc();
            return self.healthy(state, now);
        }

        let entry = &mut state.categories[category];
        entry.has_triggered = true;
        entry.trigger_count += 1;
        let trigger_count = entry.trigger_count;

        if intensity.elapsed > self.config.crash_threshold() {
            error!(%category, trigger_count, elapsed = ?intensity.elapsed, "Server crashed due to sustained {category}!");
            CHAOS_TICKS.with_label_values(&["crashed"]).inc();
            CHAOS_CRASHES.with_label_values(&[category.into()]).inc();
            self.reset_cycle(state, category, now);
            return Decision::Done(ChaosOutcome::Crash {
                category,
                trigger_count,
            });
        }

        Decision::Inject {
            category,
            trigger_count,
            intensity,
        }
    }

    fn select(&self, state: &mut ChaosState, now: Instant) {
        let Some(category) = select_category(&self.config.chances, &mut state.rng) else {
            return;
        };

        state.cycle.active = Some(category);
        let entry = &mut state.categories[category];
        if entry.trigger_count == 0 {
            entry.activated_at = Some(now);
        }

        info!(%category, "Chaos Monkey selected crash type");
        CHAOS_ACTIVE_CATEGORY
            .with_label_values(&[category.into()])
            .set(1);
    }

    /// Crashed -> Resetting. Clears the crashed category and the cycle, drops
    /// accumulated memory, and cancels the cycle's background work. Warm-up
    /// restarts once the restart pause is over.
    fn reset_cycle(&self, state: &mut ChaosState, crashed: CrashCategory, now: Instant) {
        state.categories[crashed] = CategoryState::default();

        let initial_delay = self.config.draw_initial_delay(&mut state.rng);
        let cycle = &mut state.cycle;
        cycle.active = None;
        cycle.warmup_started = false;
        cycle.warmup_started_at = None;
        cycle.origin = now.checked_add(self.config.restart_pause).unwrap_or_else(|| {
            warn!(pause = ?self.config.restart_pause, "Restart pause out of range, restarting immediately");
            now
        });
        cycle.initial_delay = initial_delay;
        cycle.generation += 1;

        self.injectors.reset();
        let cancelled = self.work.cancel_cycle();

        info!(
            generation = cycle.generation,
            cancelled_tasks = cancelled,
            "Server crashed, restarting at application level... (Initial delay: {:?})",
            initial_delay
        );
        CHAOS_CYCLE_RESETS.inc();
        CHAOS_ACTIVE_CATEGORY
            .with_label_values(&[crashed.into()])
            .set(0);
        CHAOS_MEMORY_BYTES.set(0);
        CHAOS_BACKGROUND_TASKS.set(self.work.live_tasks() as i64);
    }

    fn healthy(&self, state: &ChaosState, now: Instant) -> Decision {
        Decision::Done(ChaosOutcome::Healthy(self.report(state, now)))
    }

    fn report(&self, state: &ChaosState, now: Instant) -> StatusReport {
        StatusReport::capture(state, now)
            .with_resources(self.injectors.memory.len(), self.work.live_tasks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::CyclePhase;
    use crate::config::{CategoryChances, InjectorLimits};
    use std::sync::Arc;

    const TICK: Duration = Duration::from_secs(5);

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn light_limits() -> InjectorLimits {
        InjectorLimits {
            cpu_iterations: 1_000,
            memory_chunk_bytes: 64,
            network_delay: Duration::from_millis(5),
            resource_holders: 2,
            resource_hold: secs(3600),
        }
    }

    fn config(chances: CategoryChances) -> ChaosConfig {
        ChaosConfig {
            chances,
            initial_delay_min: Duration::ZERO,
            initial_delay_max: Duration::ZERO,
            limits: light_limits(),
            seed: Some(42),
            ..Default::default()
        }
    }

    fn cpu_only() -> CategoryChances {
        CategoryChances::new(1.0, 0.0, 0.0, 0.0)
    }

    fn snapshot(supervisor: &ChaosSupervisor) -> (CycleState, CategoryStates) {
        let state = supervisor.state.lock();
        (state.cycle.clone(), state.categories.clone())
    }

    #[tokio::test]
    async fn initial_delay_then_warmup_then_selection() {
        let t0 = Instant::now();
        let supervisor = ChaosSupervisor::starting_at(
            ChaosConfig {
                initial_delay_min: secs(20),
                initial_delay_max: secs(20),
                ..config(cpu_only())
            },
            t0,
        );

        for at in [0, 5, 10, 15] {
            assert_eq!(
                supervisor.tick(t0 + secs(at)).await,
                ChaosOutcome::Initializing {
                    remaining: secs(20 - at)
                }
            );
        }

        // one-tick no-op once the delay is over
        let ChaosOutcome::Healthy(report) = supervisor.tick(t0 + secs(20)).await else {
            panic!("warm-up tick must be healthy");
        };
        assert_eq!(report.phase, CyclePhase::Idle);
        assert_eq!(report.category, None);

        // still inside the stabilization delay
        let ChaosOutcome::Healthy(report) = supervisor.tick(t0 + secs(25)).await else {
            panic!("selection must wait for stabilization");
        };
        assert_eq!(report.category, None);

        match supervisor.tick(t0 + secs(30)).await {
            ChaosOutcome::Failure {
                category,
                trigger_count,
                effect,
            } => {
                assert_eq!(category, CrashCategory::HighCpuLoad);
                assert_eq!(trigger_count, 1);
                assert_eq!(effect, InjectionEffect::CpuBurn { iterations: 0 });
            }
            other => panic!("first evaluation must fire, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requests_between_ticks_only_observe() {
        let t0 = Instant::now();
        let supervisor = ChaosSupervisor::starting_at(config(cpu_only()), t0);

        supervisor.tick(t0).await;
        let before = snapshot(&supervisor);
        for ms in [1, 500, 4_999] {
            let outcome = supervisor.tick(t0 + Duration::from_millis(ms)).await;
            assert!(matches!(outcome, ChaosOutcome::Healthy(_)));
        }
        assert_eq!(snapshot(&supervisor), before);
    }

    #[tokio::test]
    async fn zero_chances_stay_healthy_forever() {
        let t0 = Instant::now();
        let supervisor = ChaosSupervisor::starting_at(config(CategoryChances::disabled()), t0);

        for n in 0..500u64 {
            match supervisor.tick(t0 + TICK * n as u32).await {
                ChaosOutcome::Healthy(report) => {
                    assert_eq!(report.running_message(), "Server is running... (No chaos active)");
                }
                other => panic!("no category may ever activate, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn zero_windows_crash_on_the_tick_after_selection() {
        let t0 = Instant::now();
        let supervisor = ChaosSupervisor::starting_at(
            ChaosConfig {
                buildup_duration: Duration::ZERO,
                crash_window: Duration::ZERO,
                stabilization_delay: Duration::ZERO,
                ..config(cpu_only())
            },
            t0,
        );

        assert!(matches!(supervisor.tick(t0).await, ChaosOutcome::Healthy(_)));
        // selection stamps activation with this tick's `now`, so elapsed is
        // exactly zero and the strict threshold cannot trip yet
        assert!(matches!(
            supervisor.tick(t0 + secs(5)).await,
            ChaosOutcome::Failure { trigger_count: 1, .. }
        ));
        assert_eq!(
            supervisor.tick(t0 + secs(10)).await,
            ChaosOutcome::Crash {
                category: CrashCategory::HighCpuLoad,
                trigger_count: 2
            }
        );

        let (cycle, categories) = snapshot(&supervisor);
        assert_eq!(cycle.active, None);
        assert!(!cycle.warmup_started);
        assert_eq!(cycle.generation, 1);
        assert_eq!(cycle.origin, t0 + secs(12));
        assert_eq!(categories[CrashCategory::HighCpuLoad], CategoryState::default());
        assert_eq!(
            supervisor.status(t0 + secs(11)).phase,
            CyclePhase::Resetting
        );

        // warm-up starts again once the restart pause is over
        assert!(matches!(
            supervisor.tick(t0 + secs(15)).await,
            ChaosOutcome::Healthy(StatusReport {
                phase: CyclePhase::Idle,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unrepresentable_durations_never_panic() {
        let t0 = Instant::now();
        let huge = Duration::from_secs(u64::MAX);
        let delayed = ChaosSupervisor::starting_at(
            ChaosConfig {
                initial_delay_min: huge,
                initial_delay_max: huge,
                ..config(cpu_only())
            },
            t0,
        );
        assert!(matches!(
            delayed.tick(t0).await,
            ChaosOutcome::Initializing { .. }
        ));
        assert_eq!(delayed.status(t0).phase, CyclePhase::WarmingUp);

        let paused = ChaosSupervisor::starting_at(
            ChaosConfig {
                buildup_duration: Duration::ZERO,
                crash_window: Duration::ZERO,
                stabilization_delay: Duration::ZERO,
                restart_pause: huge,
                ..config(cpu_only())
            },
            t0,
        );
        paused.tick(t0).await;
        paused.tick(t0 + secs(5)).await;
        assert!(matches!(
            paused.tick(t0 + secs(10)).await,
            ChaosOutcome::Crash { .. }
        ));
        assert_eq!(snapshot(&paused).0.origin, t0 + secs(10));
    }

    #[tokio::test]
    async fn crash_only_after_buildup_and_crash_window() {
        let t0 = Instant::now();
        let supervisor = ChaosSupervisor::starting_at(
            ChaosConfig {
                buildup_duration: secs(60),
                crash_window: secs(30),
                stabilization_delay: Duration::ZERO,
                ..config(cpu_only())
            },
            t0,
        );

        supervisor.tick(t0).await;
        let selected_at = t0 + secs(5);
        let mut elapsed = 0;
        loop {
            let outcome = supervisor.tick(selected_at + secs(elapsed)).await;
            if elapsed <= 90 {
                assert!(
                    !matches!(outcome, ChaosOutcome::Crash { .. }),
                    "crashed early at {elapsed}s"
                );
            } else {
                assert!(matches!(outcome, ChaosOutcome::Crash { .. }));
                break;
            }
            elapsed += 5;
        }
        assert_eq!(elapsed, 95);
    }

    #[tokio::test]
    async fn memory_growth_accumulates_and_resets_with_the_cycle() {
        let t0 = Instant::now();
        let supervisor = ChaosSupervisor::starting_at(
            ChaosConfig {
                buildup_duration: Duration::ZERO,
                crash_window: secs(60),
                stabilization_delay: Duration::ZERO,
                ..config(CategoryChances::new(0.0, 1.0, 0.0, 0.0))
            },
            t0,
        );

        supervisor.tick(t0).await;
        let mut previous = 0;
        let mut at = 5;
        loop {
            match supervisor.tick(t0 + secs(at)).await {
                ChaosOutcome::Failure {
                    effect: InjectionEffect::MemoryGrowth { total_bytes, .. },
                    ..
                } => {
                    assert!(total_bytes >= previous);
                    assert_eq!(total_bytes, supervisor.injectors().memory.len());
                    previous = total_bytes;
                }
                ChaosOutcome::Crash { category, .. } => {
                    assert_eq!(category, CrashCategory::MemoryLeak);
                    break;
                }
                other => panic!("unexpected outcome {other:?}"),
            }
            at += 5;
        }
        assert!(previous > 0);
        assert!(supervisor.injectors().memory.is_empty());
        assert_eq!(supervisor.status(t0 + secs(at)).memory_bytes, 0);
    }

    #[tokio::test]
    async fn reset_cancels_background_work_of_the_cycle() {
        let t0 = Instant::now();
        let supervisor = ChaosSupervisor::starting_at(
            ChaosConfig {
                buildup_duration: Duration::ZERO,
                crash_window: Duration::ZERO,
                stabilization_delay: Duration::ZERO,
                ..config(CategoryChances::new(0.0, 0.0, 0.0, 1.0))
            },
            t0,
        );

        supervisor.tick(t0).await;
        assert_eq!(
            supervisor.tick(t0 + secs(5)).await,
            ChaosOutcome::Failure {
                category: CrashCategory::ResourceExhaustion,
                trigger_count: 1,
                effect: InjectionEffect::ResourceExhaustion { holders: 2 },
            }
        );
        assert_eq!(supervisor.background().live_tasks(), 2);

        assert!(matches!(
            supervisor.tick(t0 + secs(10)).await,
            ChaosOutcome::Crash { .. }
        ));
        tokio::time::timeout(secs(5), supervisor.background().wait_idle())
            .await
            .expect("stale holders cancelled on reset");
    }

    #[tokio::test]
    async fn status_never_mutates_state() {
        let t0 = Instant::now();
        let supervisor = ChaosSupervisor::starting_at(
            ChaosConfig {
                stabilization_delay: Duration::ZERO,
                ..config(cpu_only())
            },
            t0,
        );
        supervisor.tick(t0).await;
        supervisor.tick(t0 + secs(5)).await;

        let before = snapshot(&supervisor);
        for n in 0..1_000u64 {
            let report = supervisor.status(t0 + secs(5 + n));
            assert_eq!(report.category, Some(CrashCategory::HighCpuLoad));
        }
        assert_eq!(snapshot(&supervisor), before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_claim_a_tick_once() {
        let t0 = Instant::now();
        let supervisor = Arc::new(ChaosSupervisor::starting_at(
            ChaosConfig {
                stabilization_delay: Duration::ZERO,
                ..config(CategoryChances::new(0.25, 0.25, 0.25, 0.25))
            },
            t0,
        ));
        supervisor.tick(t0).await;

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let supervisor = supervisor.clone();
                tokio::spawn(async move { supervisor.tick(t0 + secs(5)).await })
            })
            .collect();

        let mut failures = 0;
        for handle in handles {
            if let ChaosOutcome::Failure { trigger_count, .. } = handle.await.unwrap() {
                assert_eq!(trigger_count, 1);
                failures += 1;
            }
        }
        assert_eq!(failures, 1);

        let (cycle, categories) = snapshot(&supervisor);
        assert!(cycle.active.is_some());
        assert_eq!(categories.iter().map(|s| s.trigger_count).sum::<u64>(), 1);
    }
}
