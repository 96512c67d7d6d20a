use alloc::sync::Arc;

use keel_drivers::{AutomaticDriverReference, Driver, DriverId, Registry};
use keel_sched::{
    PageAllocator, Process, Processes, Scheduler, ThreadEntry, ThreadId, DEFAULT_PROCESS_PRIORITY,
};
use log::{error, info};

use crate::config::{self, KernelScheduler};
use crate::{KernelError, Result};

/// The single handle through which boot code and interrupt entry points
/// reach the driver registry, the process table and the scheduler
///
/// One context lives for the whole life of the kernel. It owns the registry,
/// so every driver, reference and thread hangs off it.
pub struct KernelContext {
    registry: Registry,
    processes: Processes,
    pages: Arc<dyn PageAllocator>,
    scheduler: AutomaticDriverReference<dyn Scheduler>,
    kernel: spin::Once<Arc<Process>>,
    boot_thread: spin::Once<ThreadId>,
}

impl KernelContext {
    pub fn new(pages: Arc<dyn PageAllocator>) -> Self {
        Self {
            registry: Registry::new(),
            processes: Processes::new(),
            pages,
            scheduler: AutomaticDriverReference::new(),
            kernel: spin::Once::new(),
            boot_thread: spin::Once::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn processes(&self) -> &Processes {
        &self.processes
    }

    pub fn pages(&self) -> &Arc<dyn PageAllocator> {
        &self.pages
    }

    pub fn install<D: Driver>(&self, driver: Arc<D>) -> DriverId {
        self.registry.install(driver)
    }

    /// Install the scheduler driver selected by the build configuration
    pub fn install_scheduler(&self) -> (DriverId, Arc<KernelScheduler>) {
        let scheduler = Arc::new(config::scheduler(self.pages.clone()));
        (self.install(scheduler.clone()), scheduler)
    }

    /// Bring the kernel up
    ///
    /// Starts the automatic drivers, resolves a scheduler (there is no
    /// kernel without one), registers the calling flow as the first thread
    /// of the `kernel` process and logs the driver table. Booting twice
    /// returns the thread adopted the first time.
    pub fn boot(&self) -> Result<ThreadId> {
        if let Some(thread) = self.boot_thread.get() {
            return Ok(*thread);
        }

        let started = self.registry.start_automatic_drivers();
        info!("{} automatic driver(s) started", started);

        let scheduler = match self.registry.find_and_activate::<dyn Scheduler>() {
            Ok(handle) => {
                let scheduler = handle.capability().clone();
                self.scheduler.set(&self.registry, Some(handle));
                scheduler
            }
            Err(err) => {
                error!("boot: {}", err);
                return Err(KernelError::NoScheduler);
            }
        };

        let kernel = self.kernel_process().clone();
        let thread = *self
            .boot_thread
            .call_once(|| scheduler.adopt_current(kernel.create_current_thread()));
        info!("boot flow running as {} in {}", thread, kernel.name());

        self.registry.log_summary();
        Ok(thread)
    }

    pub fn boot_thread(&self) -> Option<ThreadId> {
        self.boot_thread.get().copied()
    }

    /// The process that owns the boot flow and kernel threads
    pub fn kernel_process(&self) -> &Arc<Process> {
        self.kernel
            .call_once(|| self.processes.create("kernel", DEFAULT_PROCESS_PRIORITY))
    }

    pub fn create_process(&self, name: &str, priority: u32) -> Arc<Process> {
        self.processes.create(name, priority)
    }

    /// The active scheduler, starting one on first use
    pub fn scheduler(&self) -> Option<Arc<dyn Scheduler>> {
        self.scheduler.get(&self.registry)
    }

    /// Create a thread with its own stack in `process` and make it runnable
    pub fn spawn_kernel_thread(
        &self,
        process: &Arc<Process>,
        entry: ThreadEntry,
        priority: u32,
    ) -> Result<ThreadId> {
        let scheduler = self.scheduler().ok_or(KernelError::NoScheduler)?;
        let thread = process
            .create_kernel_thread(self.pages.as_ref(), entry)?
            .with_priority(priority);
        Ok(scheduler.add_thread(thread))
    }

    /// Put the calling thread to sleep for at least `usecs`
    pub fn sleep(&self, usecs: u64) -> Result<()> {
        let scheduler = self.scheduler().ok_or(KernelError::NoScheduler)?;
        if let Some(current) = scheduler.current_thread() {
            scheduler.sleep_thread(current, usecs)?;
        }
        Ok(())
    }

    /// Hardware IRQ entry
    pub fn on_irq(&self, irq: u8) {
        self.registry.on_irq(irq);
    }

    /// CPU exception/vector entry; false if no driver claimed it
    pub fn on_interrupt(&self, vector: u8) -> bool {
        self.registry.on_interrupt(vector)
    }

    /// Scheduler tick
    ///
    /// Never activates anything: interrupt context only preempts through a
    /// scheduler that is already running.
    pub fn on_timer_interrupt(&self) {
        if let Some(scheduler) = self.scheduler.reference().get() {
            scheduler.yield_now();
        }
    }

    /// Free terminated threads; returns how many were released
    pub fn reap(&self) -> usize {
        self.scheduler
            .reference()
            .get()
            .map_or(0, |scheduler| scheduler.reap_terminated())
    }
}
