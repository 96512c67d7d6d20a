//! Manual clock and a started scheduler for the integration tests

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, Layout};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use keel_drivers::*;
use keel_sched::*;

pub static MANUAL_TIMER: DriverType = DriverType::new("manualTimer", "Manual Timer", Some(&TIMER));

/// Timer whose clock only moves when a test says so
#[derive(Default)]
pub struct ManualTimer {
    now: AtomicU64,
    armed: AtomicU64,
    arms: AtomicUsize,
}

impl ManualTimer {
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, usecs: u64) {
        self.now.fetch_add(usecs, Ordering::SeqCst);
    }

    /// Last one-shot period requested
    pub fn armed(&self) -> u64 {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn arms(&self) -> usize {
        self.arms.load(Ordering::SeqCst)
    }
}

impl Timer for ManualTimer {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn arm_oneshot(&self, usecs: u64) {
        self.armed.store(usecs, Ordering::SeqCst);
        self.arms.fetch_add(1, Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.armed.store(0, Ordering::SeqCst);
    }
}

impl Driver for ManualTimer {
    fn driver_type(&self) -> &'static DriverType {
        &MANUAL_TIMER
    }

    fn on_start(&self, _api: &DriverApi<'_>) -> keel_drivers::Result<()> {
        Ok(())
    }

    fn provide(self: Arc<Self>, capabilities: &mut Capabilities) {
        capabilities.provide::<dyn Timer>(self);
    }
}

/// Page pool over leaked, page-aligned host memory
pub fn pool(pages: usize) -> Arc<PagePool> {
    let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
    let pool = PagePool::empty();
    unsafe {
        let region = alloc_zeroed(layout);
        assert!(!region.is_null());
        pool.init(region, layout.size());
    }
    Arc::new(pool)
}

pub struct Fixture<P: SchedulingPolicy> {
    pub registry: Registry,
    pub timer: Arc<ManualTimer>,
    pub timer_id: DriverId,
    pub scheduler: Arc<CpuScheduler<P>>,
    pub scheduler_id: DriverId,
    pub pages: Arc<PagePool>,
    pub processes: Processes,
    pub kernel: Arc<Process>,
}

impl<P: SchedulingPolicy> Fixture<P> {
    /// Install a timer and a scheduler, then start the scheduler the way
    /// boot code does: by asking for the capability
    pub fn start(policy: P) -> Self {
        let registry = Registry::new();
        let timer = Arc::new(ManualTimer::default());
        let timer_id = registry.install(timer.clone());
        let pages = pool(16);
        let scheduler = Arc::new(CpuScheduler::new(policy, pages.clone()));
        let scheduler_id = registry.install(scheduler.clone());

        let found = registry.find_and_activate::<dyn Scheduler>().unwrap();
        assert_eq!(found.id(), scheduler_id);

        let processes = Processes::new();
        let kernel = processes.create("kernel", DEFAULT_PROCESS_PRIORITY);
        Self {
            registry,
            timer,
            timer_id,
            scheduler,
            scheduler_id,
            pages,
            processes,
            kernel,
        }
    }

    /// Register the test's own flow of execution as the running thread
    pub fn adopt_boot(&self) -> ThreadId {
        self.scheduler.adopt_current(self.kernel.create_current_thread())
    }

    pub fn spawn(&self, priority: u32) -> ThreadId {
        self.scheduler
            .add_thread(self.kernel.create_current_thread().with_priority(priority))
    }
}

pub fn weighted() -> Fixture<WeightedRoundRobin> {
    Fixture::start(WeightedRoundRobin::default())
}
