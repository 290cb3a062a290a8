//! Failure injection strategies
//!
//! Every injector scales its severity linearly with the buildup progress and
//! is capped by [`InjectorLimits`]. Work that outlives the triggering request
//! is spawned through [`BackgroundWork`], which ties it to the current cycle
//! and cancels it when the cycle resets.

use super::CrashCategory;
use crate::config::InjectorLimits;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::*;

// iterations between two cancellation checks of a CPU burn
const CANCEL_CHECK_STRIDE: u64 = 4_096;

/// Observable result of one injection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionEffect {
    CpuBurn { iterations: u64 },
    MemoryGrowth { chunk_bytes: usize, total_bytes: usize },
    NetworkDelay { delay: Duration },
    ResourceExhaustion { holders: usize },
}

/// Background tasks spawned on behalf of the current cycle
#[derive(Debug)]
pub struct BackgroundWork {
    tracker: TaskTracker,
    cycle: Mutex<CancellationToken>,
}

impl Default for BackgroundWork {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundWork {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            cycle: Mutex::new(CancellationToken::new()),
        }
    }

    /// Token cancelled when the current cycle resets
    pub fn cycle_token(&self) -> CancellationToken {
        self.cycle.lock().child_token()
    }

    /// Spawns an async task that is abandoned as soon as the cycle resets
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.cycle_token();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });
    }

    /// Spawns blocking work on the blocking pool. The closure receives the
    /// cycle token and is expected to poll it.
    pub fn spawn_blocking<F>(&self, task: F)
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let token = self.cycle_token();
        let tracked = self.tracker.token();
        tokio::task::spawn_blocking(move || {
            let _tracked = tracked;
            task(token)
        });
    }

    /// Cancels every task of the finished cycle and opens a new one.
    /// Returns the number of tasks that were still running.
    pub fn cancel_cycle(&self) -> usize {
        let live = self.tracker.len();
        let mut cycle = self.cycle.lock();
        cycle.cancel();
        *cycle = CancellationToken::new();
        live
    }

    /// Number of tasks that have not finished yet
    pub fn live_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Waits until every spawned task has completed
    #[cfg(test)]
    pub(crate) async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// One failure category's way of degrading the server
#[async_trait]
pub trait FailureInjector: Send + Sync {
    fn category(&self) -> CrashCategory;

    /// Applies the failure at `progress` in `[0, 1]`
    async fn inject(&self, progress: f64, work: &BackgroundWork) -> InjectionEffect;

    /// Drops whatever the injector accumulated during the finished cycle
    fn reset(&self) {}
}

fn scaled(cap: f64, progress: f64) -> f64 {
    (cap * progress.clamp(0.0, 1.0)).min(cap)
}

/// Detached busy loop on the blocking pool
#[derive(Debug)]
pub struct CpuBurn {
    max_iterations: u64,
}

impl CpuBurn {
    pub fn new(max_iterations: u64) -> Self {
        Self { max_iterations }
    }

    pub fn iterations(&self, progress: f64) -> u64 {
        scaled(self.max_iterations as f64, progress) as u64
    }
}

#[async_trait]
impl FailureInjector for CpuBurn {
    fn category(&self) -> CrashCategory {
        CrashCategory::HighCpuLoad
    }

    async fn inject(&self, progress: f64, work: &BackgroundWork) -> InjectionEffect {
        let iterations = self.iterations(progress);
        work.spawn_blocking(move |token| {
            let mut rng = rand::thread_rng();
            let mut acc = 0u64;
            for i in 0..iterations {
                if i % CANCEL_CHECK_STRIDE == 0 && token.is_cancelled() {
                    debug!("CPU burn cancelled after {i} iterations");
                    break;
                }
                acc = acc.wrapping_add(rng.gen::<u64>());
            }
            std::hint::black_box(acc);
        });
        InjectionEffect::CpuBurn { iterations }
    }
}

/// Random bytes appended to a buffer that only grows within a cycle
#[derive(Debug)]
pub struct MemoryGrowth {
    max_chunk_bytes: usize,
    buffer: Mutex<Vec<u8>>,
}

impl MemoryGrowth {
    pub fn new(max_chunk_bytes: usize) -> Self {
        Self {
            max_chunk_bytes,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn chunk_bytes(&self, progress: f64) -> usize {
        scaled(self.max_chunk_bytes as f64, progress) as usize
    }

    /// Bytes currently retained
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn grow(&self, chunk_bytes: usize) -> usize {
        let mut buffer = self.buffer.lock();
        let mut chunk = vec![0u8; chunk_bytes];
        rand::thread_rng().fill(&mut chunk[..]);
        buffer.extend_from_slice(&chunk);
        buffer.len()
    }
}

#[async_trait]
impl FailureInjector for MemoryGrowth {
    fn category(&self) -> CrashCategory {
        CrashCategory::MemoryLeak
    }

    async fn inject(&self, progress: f64, _work: &BackgroundWork) -> InjectionEffect {
        let chunk_bytes = self.chunk_bytes(progress);
        let total_bytes = self.grow(chunk_bytes);
        InjectionEffect::MemoryGrowth {
            chunk_bytes,
            total_bytes,
        }
    }

    fn reset(&self) {
        *self.buffer.lock() = Vec::new();
    }
}

/// Holds the triggering request for a random delay
#[derive(Debug)]
pub struct NetworkDelay {
    max_delay: Duration,
}

impl NetworkDelay {
    pub fn new(max_delay: Duration) -> Self {
        Self { max_delay }
    }

    pub fn max_delay(&self, progress: f64) -> Duration {
        self.max_delay.mul_f64(progress.clamp(0.0, 1.0)).min(self.max_delay)
    }

    pub fn sample_delay<R: Rng + ?Sized>(&self, progress: f64, rng: &mut R) -> Duration {
        rng.gen_range(Duration::ZERO..=self.max_delay(progress))
    }
}

#[async_trait]
impl FailureInjector for NetworkDelay {
    fn category(&self) -> CrashCategory {
        CrashCategory::NetworkDelay
    }

    async fn inject(&self, progress: f64, _work: &BackgroundWork) -> InjectionEffect {
        let delay = self.sample_delay(progress, &mut rand::thread_rng());
        tokio::time::sleep(delay).await;
        InjectionEffect::NetworkDelay { delay }
    }
}

/// Short-lived tasks that each sit on a resource before releasing it
#[derive(Debug)]
pub struct ResourceExhaustion {
    max_holders: usize,
    hold: Duration,
}

impl ResourceExhaustion {
    pub fn new(max_holders: usize, hold: Duration) -> Self {
        Self { max_holders, hold }
    }

    pub fn holders(&self, progress: f64) -> usize {
        scaled(self.max_holders as f64, progress) as usize
    }
}

#[async_trait]
impl FailureInjector for ResourceExhaustion {
    fn category(&self) -> CrashCategory {
        CrashCategory::ResourceExhaustion
    }

    async fn inject(&self, progress: f64, work: &BackgroundWork) -> InjectionEffect {
        let holders = self.holders(progress);
        for _ in 0..holders {
            work.spawn(tokio::time::sleep(self.hold));
        }
        InjectionEffect::ResourceExhaustion { holders }
    }
}

/// The four injectors, one per category
#[derive(Debug)]
pub struct InjectorSet {
    pub cpu: CpuBurn,
    pub memory: MemoryGrowth,
    pub network: NetworkDelay,
    pub resource: ResourceExhaustion,
}

impl InjectorSet {
    pub fn new(limits: &InjectorLimits) -> Self {
        Self {
            cpu: CpuBurn::new(limits.cpu_iterations),
            memory: MemoryGrowth::new(limits.memory_chunk_bytes),
            network: NetworkDelay::new(limits.network_delay),
            resource: ResourceExhaustion::new(limits.resource_holders, limits.resource_hold),
        }
    }

    pub fn get(&self, category: CrashCategory) -> &dyn FailureInjector {
        match category {
            CrashCategory::HighCpuLoad => &self.cpu,
            CrashCategory::MemoryLeak => &self.memory,
            CrashCategory::NetworkDelay => &self.network,
            CrashCategory::ResourceExhaustion => &self.resource,
        }
    }

    pub fn reset(&self) {
        for injector in [
            self.get(CrashCategory::HighCpuLoad),
            self.get(CrashCategory::MemoryLeak),
            self.get(CrashCategory::NetworkDelay),
            self.get(CrashCategory::ResourceExhaustion),
        ] {
            injector.reset();
        }
    }
}
