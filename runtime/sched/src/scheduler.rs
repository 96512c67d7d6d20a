//! Scheduler capability and the CPU scheduler driver
//!
//! [`CpuScheduler`] is an ordinary driver: boot code finds it through the
//! registry as `dyn Scheduler`. Starting it claims a timer, and losing that
//! timer fails the scheduler. The timer interrupt calls
//! [`Scheduler::yield_now`], which picks the next thread under one
//! interrupt-masking lock and then performs the register swap with only the
//! critical section held.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use keel_drivers::sync::{CriticalSection, IrqSpinlock};
use keel_drivers::{
    Capabilities, Capability, Driver, DriverApi, DriverError, DriverId, DriverReference,
    DriverType, Timer, SOFTWARE,
};
use log::{debug, info, trace};

use crate::arch::{self, SavedContext};
use crate::memory::{Page, PageAllocator};
use crate::policy::SchedulingPolicy;
use crate::table::{ThreadCounts, ThreadTable};
use crate::thread::{Thread, ThreadId, ThreadState};
use crate::{Result, SchedulerError};

pub static SCHEDULER: DriverType = DriverType::new("scheduler", "Thread Scheduler", Some(&SOFTWARE));

/// A driver that multiplexes threads onto the CPU
pub trait Scheduler: Send + Sync {
    /// Take ownership of a new thread and queue it by its state
    fn add_thread(&self, thread: Thread) -> ThreadId;

    /// Register the flow of execution that is running right now
    fn adopt_current(&self, thread: Thread) -> ThreadId;

    /// Take a thread back out of the scheduler, whatever its state
    ///
    /// The thread's stack page goes back to the scheduler's allocator; the
    /// returned thread has no stack.
    fn remove_thread(&self, id: ThreadId) -> Result<Thread>;

    fn current_thread(&self) -> Option<ThreadId>;

    /// Give up the CPU; deferred while the scheduler is locked
    fn yield_now(&self);

    fn sleep_thread(&self, id: ThreadId, usecs: u64) -> Result<()>;
    fn pause_thread(&self, id: ThreadId) -> Result<()>;
    fn resume_thread(&self, id: ThreadId) -> Result<()>;
    fn terminate_thread(&self, id: ThreadId) -> Result<()>;

    /// Terminate the calling thread and switch away
    fn exit_current(&self);

    fn set_thread_priority(&self, id: ThreadId, priority: u32) -> Result<()>;

    /// A process priority changed; re-sum the cached weights
    fn priorities_changed(&self);

    fn thread_state(&self, id: ThreadId) -> Option<ThreadState>;

    /// Hold off preemption until the matching [`Scheduler::unlock`]
    fn lock(&self);
    fn unlock(&self);

    /// Free terminated threads; returns how many were reaped
    fn reap_terminated(&self) -> usize;
}

impl Capability for dyn Scheduler {
    const TYPE: &'static DriverType = &SCHEDULER;
}

/// Scoped [`Scheduler::lock`]
#[must_use = "preemption is allowed again as soon as the guard drops"]
pub struct PreemptionGuard<'a> {
    scheduler: &'a dyn Scheduler,
}

impl<'a> PreemptionGuard<'a> {
    pub fn new(scheduler: &'a dyn Scheduler) -> Self {
        scheduler.lock();
        Self { scheduler }
    }
}

impl Drop for PreemptionGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.unlock();
    }
}

/// Whose registers are live on the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occupant {
    Boot,
    Idle,
    Thread(ThreadId),
}

struct IdleThread {
    context: Box<SavedContext>,
    _stack: Page,
}

struct RunState {
    threads: ThreadTable,
    current: Option<ThreadId>,
    on_cpu: Occupant,
    idle: Option<IdleThread>,
    boot: Box<SavedContext>,
}

impl RunState {
    fn context_of(&mut self, occupant: Occupant) -> Option<*mut SavedContext> {
        match occupant {
            Occupant::Boot => Some(&mut *self.boot as *mut SavedContext),
            Occupant::Idle => self
                .idle
                .as_mut()
                .map(|idle| &mut *idle.context as *mut SavedContext),
            Occupant::Thread(id) => self
                .threads
                .get_mut(id)
                .map(|thread| &mut *thread.context as *mut SavedContext),
        }
    }

    fn running_thread(&self) -> Option<ThreadId> {
        match self.on_cpu {
            Occupant::Thread(id) => Some(id),
            _ => None,
        }
    }
}

enum Decision {
    Stay(u64),
    Switch {
        from: *mut SavedContext,
        to: *const SavedContext,
        slice: u64,
    },
}

extern "C" fn idle_entry() {
    loop {
        arch::idle_wait();
    }
}

extern "C" fn idle_exit(_: *const ()) {}

extern "C" fn exit_trampoline<P: SchedulingPolicy>(scheduler: *const ()) {
    // SAFETY: add_thread primed this frame with the address of a live
    // scheduler, which stays put for as long as it has threads.
    let scheduler = unsafe { &*(scheduler as *const CpuScheduler<P>) };
    scheduler.exit_current();
}

/// Preemptive round-robin scheduler driven by a one-shot timer
///
/// Once a thread has been added, the scheduler must stay at a fixed address
/// (it normally lives in the registry's `Arc`): new threads return into it
/// when their entry function finishes.
pub struct CpuScheduler<P: SchedulingPolicy> {
    policy: P,
    pages: Arc<dyn PageAllocator>,
    timer: DriverReference<dyn Timer>,
    state: IrqSpinlock<RunState>,
    lock_depth: AtomicU32,
    deferred_yields: AtomicU32,
    switches: AtomicU64,
    id: spin::Once<DriverId>,
}

impl<P: SchedulingPolicy> CpuScheduler<P> {
    pub fn new(policy: P, pages: Arc<dyn PageAllocator>) -> Self {
        Self {
            policy,
            pages,
            timer: DriverReference::new(),
            state: IrqSpinlock::new(RunState {
                threads: ThreadTable::new(),
                current: None,
                on_cpu: Occupant::Boot,
                idle: None,
                boot: Box::new(SavedContext::default()),
            }),
            lock_depth: AtomicU32::new(0),
            deferred_yields: AtomicU32::new(0),
            switches: AtomicU64::new(0),
            id: spin::Once::new(),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Registry id, once the scheduler has been started
    pub fn driver_id(&self) -> Option<DriverId> {
        self.id.get().copied()
    }

    /// Current time on the claimed timer
    pub fn now(&self) -> Result<u64> {
        self.timer
            .get()
            .map(|timer| timer.now())
            .ok_or(SchedulerError::NotStarted)
    }

    pub fn total_active_priority(&self) -> u64 {
        self.state.lock().threads.total_active_priority()
    }

    pub fn counts(&self) -> ThreadCounts {
        self.state.lock().threads.counts()
    }

    /// Threads in any list, terminated ones included until reaped
    pub fn thread_count(&self) -> usize {
        self.counts().total()
    }

    pub fn active_thread_count(&self) -> usize {
        self.state.lock().threads.active_len()
    }

    /// Active list in service order
    pub fn active_threads(&self) -> Vec<ThreadId> {
        self.state.lock().threads.active().collect()
    }

    /// Sleeping list in wake order
    pub fn sleeping_threads(&self) -> Vec<ThreadId> {
        self.state.lock().threads.sleeping().collect()
    }

    /// Slice `id` would get if it were picked now
    pub fn slice_for(&self, id: ThreadId) -> Option<u64> {
        let state = self.state.lock();
        self.slice_locked(&state.threads, id)
    }

    fn slice_locked(&self, threads: &ThreadTable, id: ThreadId) -> Option<u64> {
        let weight = threads.get(id)?.weight();
        Some(
            self.policy
                .slice(weight, threads.active_len(), threads.total_active_priority()),
        )
    }

    pub fn switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// True while the idle thread owns the CPU
    pub fn is_idle(&self) -> bool {
        self.state.lock().on_cpu == Occupant::Idle
    }

    /// Yields requested while locked and not yet run
    pub fn deferred_yields(&self) -> u32 {
        self.deferred_yields.load(Ordering::Acquire)
    }

    pub fn with_thread<R>(&self, id: ThreadId, f: impl FnOnce(&Thread) -> R) -> Option<R> {
        self.state.lock().threads.get(id).map(f)
    }

    /// Register a callback to run when `id` is reaped
    pub fn on_thread_deleted(&self, id: ThreadId, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut state = self.state.lock();
        let thread = state
            .threads
            .get_mut(id)
            .ok_or(SchedulerError::ThreadNotFound { thread: id })?;
        thread.on_deleted(callback);
        Ok(())
    }

    fn decide(&self, state: &mut RunState, now: u64) -> Decision {
        let woken = state.threads.wake_expired(now);
        if woken > 0 {
            trace!("woke {} thread(s) at {}", woken, now);
        }

        if let Some(current) = state.current {
            if state.threads.state(current) == Some(ThreadState::Active) {
                state.threads.requeue(current);
            } else {
                state.current = None;
            }
        }

        let Some(next) = state.threads.head() else {
            return self.switch_to(state, Occupant::Idle, self.policy.backoff());
        };
        if state.current == Some(next) {
            // Nothing else is runnable.
            return self.switch_to(state, Occupant::Thread(next), self.policy.backoff());
        }
        let slice = self
            .slice_locked(&state.threads, next)
            .unwrap_or_else(|| self.policy.backoff());
        self.switch_to(state, Occupant::Thread(next), slice)
    }

    fn switch_to(&self, state: &mut RunState, target: Occupant, slice: u64) -> Decision {
        if state.on_cpu == target {
            return Decision::Stay(slice);
        }
        let Some(to) = state.context_of(target) else {
            return Decision::Stay(slice);
        };
        let from = match state.context_of(state.on_cpu) {
            Some(from) => from,
            None => &mut *state.boot as *mut SavedContext,
        };

        trace!("SWITCH {:?} -> {:?} for {}us", state.on_cpu, target, slice);
        state.on_cpu = target;
        state.current = match target {
            Occupant::Thread(id) => Some(id),
            _ => None,
        };
        Decision::Switch {
            from,
            to: to as *const SavedContext,
            slice,
        }
    }

    fn transition(&self, id: ThreadId, change: impl FnOnce(&mut ThreadTable) -> bool) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.threads.contains(id) {
            return Err(SchedulerError::ThreadNotFound { thread: id });
        }
        change(&mut state.threads);
        Ok(state.current == Some(id))
    }
}

impl<P: SchedulingPolicy> Scheduler for CpuScheduler<P> {
    fn add_thread(&self, mut thread: Thread) -> ThreadId {
        thread.scheduler = self.driver_id();
        if let (Some(entry), Some(stack)) = (thread.entry(), thread.stack.as_mut()) {
            arch::prime(
                &mut thread.context,
                stack,
                entry,
                exit_trampoline::<P>,
                self as *const Self as *const (),
            );
        }
        let process = thread.process().clone();
        let id = self.state.lock().threads.insert(thread);
        process.attach(id);
        debug!("THREAD {} added to {}", id, process.name());
        id
    }

    fn adopt_current(&self, mut thread: Thread) -> ThreadId {
        thread.scheduler = self.driver_id();
        let process = thread.process().clone();
        let id = {
            let mut state = self.state.lock();
            let id = state.threads.insert(thread);
            state.current = Some(id);
            state.on_cpu = Occupant::Thread(id);
            id
        };
        process.attach(id);
        debug!("THREAD {} adopted as current in {}", id, process.name());
        id
    }

    fn remove_thread(&self, id: ThreadId) -> Result<Thread> {
        let mut thread = {
            let mut state = self.state.lock();
            if state.running_thread() == Some(id) {
                return Err(SchedulerError::ThreadRunning { thread: id });
            }
            if state.current == Some(id) {
                state.current = None;
            }
            state
                .threads
                .remove(id)
                .ok_or(SchedulerError::ThreadNotFound { thread: id })?
        };
        thread.process().detach(id);
        if let Some(stack) = thread.stack.take() {
            self.pages.free_page(stack);
        }
        Ok(thread)
    }

    fn current_thread(&self) -> Option<ThreadId> {
        self.state.lock().current
    }

    fn yield_now(&self) {
        if self.lock_depth.load(Ordering::Acquire) > 0 {
            self.deferred_yields.fetch_add(1, Ordering::AcqRel);
            return;
        }
        let Some(timer) = self.timer.get() else {
            return;
        };
        let now = timer.now();

        // Held across the switch; the incoming thread releases it.
        let _section = CriticalSection::enter();
        let decision = {
            let mut state = self.state.lock();
            self.decide(&mut state, now)
        };
        self.deferred_yields.store(0, Ordering::Release);

        match decision {
            Decision::Stay(slice) => timer.arm_oneshot(slice),
            Decision::Switch { from, to, slice } => {
                timer.arm_oneshot(slice);
                self.switches.fetch_add(1, Ordering::Relaxed);
                drop(timer);
                // SAFETY: both contexts belong to threads that cannot be
                // reaped while one is on the CPU and the other is current;
                // the state lock has been released.
                unsafe { arch::switch_context(from, to) };
            }
        }
    }

    fn sleep_thread(&self, id: ThreadId, usecs: u64) -> Result<()> {
        let deadline = self.now()?.saturating_add(usecs);
        let is_current = self.transition(id, |threads| threads.sleep(id, deadline))?;
        trace!("{} sleeps until {}", id, deadline);
        if is_current {
            self.yield_now();
        }
        Ok(())
    }

    fn pause_thread(&self, id: ThreadId) -> Result<()> {
        let is_current = self.transition(id, |threads| threads.pause(id))?;
        if is_current {
            self.yield_now();
        }
        Ok(())
    }

    fn resume_thread(&self, id: ThreadId) -> Result<()> {
        self.transition(id, |threads| threads.resume(id))?;
        Ok(())
    }

    fn terminate_thread(&self, id: ThreadId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.threads.terminate(id) && !state.threads.contains(id) {
            return Err(SchedulerError::ThreadNotFound { thread: id });
        }
        if state.current == Some(id) {
            state.current = None;
        }
        trace!("{} terminated", id);
        Ok(())
    }

    fn exit_current(&self) {
        if let Some(id) = self.current_thread() {
            if let Err(err) = self.terminate_thread(id) {
                trace!("exit of {}: {}", id, err);
            }
        }
        self.yield_now();
    }

    fn set_thread_priority(&self, id: ThreadId, priority: u32) -> Result<()> {
        if self.state.lock().threads.set_priority(id, priority) {
            Ok(())
        } else {
            Err(SchedulerError::ThreadNotFound { thread: id })
        }
    }

    fn priorities_changed(&self) {
        let total = self.state.lock().threads.recompute_total();
        trace!("total active priority now {}", total);
    }

    fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.state.lock().threads.state(id)
    }

    fn lock(&self) {
        self.lock_depth.fetch_add(1, Ordering::AcqRel);
    }

    fn unlock(&self) {
        let previous = self
            .lock_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| depth.checked_sub(1));
        if previous == Ok(1) && self.deferred_yields.swap(0, Ordering::AcqRel) > 0 {
            self.yield_now();
        }
    }

    fn reap_terminated(&self) -> usize {
        let reaped = {
            let mut state = self.state.lock();
            let keep = state.running_thread();
            state.threads.take_terminated(keep)
        };
        let count = reaped.len();
        for (id, mut thread) in reaped {
            thread.run_deleted_callbacks();
            thread.process().detach(id);
            if let Some(stack) = thread.stack.take() {
                self.pages.free_page(stack);
            }
            debug!("REAP {}", id);
        }
        count
    }
}

impl<P: SchedulingPolicy> Driver for CpuScheduler<P> {
    fn driver_type(&self) -> &'static DriverType {
        P::TYPE
    }

    fn on_start(&self, api: &DriverApi<'_>) -> keel_drivers::Result<()> {
        let needs_idle = self.state.lock().idle.is_none();
        if needs_idle {
            let mut stack = self
                .pages
                .allocate_page()
                .ok_or_else(|| DriverError::start_failed(self.name(), "no page for the idle thread"))?;
            let mut context = Box::new(SavedContext::default());
            arch::prime(&mut context, &mut stack, idle_entry, idle_exit, core::ptr::null());
            self.state.lock().idle = Some(IdleThread {
                context,
                _stack: stack,
            });
        }

        let timer = api.find_and_activate::<dyn Timer>()?;
        let id = *self.id.call_once(|| api.id());
        self.timer
            .set_on_terminated(move |registry| registry.fail_driver(id, "Timer dropped"));
        self.timer.set(api.registry(), Some(timer.clone()));
        timer.arm_oneshot(self.policy.backoff());

        info!(
            "{} running on {}, backoff {}us",
            self.name(),
            api.registry().name(timer.id()),
            self.policy.backoff()
        );
        Ok(())
    }

    fn on_stop(&self, _api: &DriverApi<'_>) -> keel_drivers::Result<()> {
        Err(DriverError::StopRefused { driver: self.name() })
    }

    fn can_stop(&self) -> bool {
        false
    }

    fn can_restart(&self) -> bool {
        false
    }

    fn provide(self: Arc<Self>, capabilities: &mut Capabilities) {
        capabilities.provide::<dyn Scheduler>(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_pool;
    use crate::policy::WeightedRoundRobin;
    use crate::process::Processes;

    fn scheduler() -> CpuScheduler<WeightedRoundRobin> {
        CpuScheduler::new(WeightedRoundRobin::default(), Arc::new(test_pool(4)))
    }

    #[test]
    fn test_unstarted_scheduler_does_not_switch() {
        let scheduler = scheduler();
        let process = Processes::new().create("kernel", 1);
        let boot = scheduler.adopt_current(process.create_current_thread());
        scheduler.add_thread(process.create_current_thread());

        scheduler.yield_now();
        assert_eq!(scheduler.current_thread(), Some(boot));
        assert_eq!(scheduler.switch_count(), 0);
        assert_eq!(
            scheduler.sleep_thread(boot, 10),
            Err(SchedulerError::NotStarted)
        );
    }

    #[test]
    fn test_running_thread_cannot_be_removed() {
        let scheduler = scheduler();
        let process = Processes::new().create("kernel", 1);
        let boot = scheduler.adopt_current(process.create_current_thread());
        let other = scheduler.add_thread(process.create_current_thread());

        assert_eq!(
            scheduler.remove_thread(boot).unwrap_err(),
            SchedulerError::ThreadRunning { thread: boot }
        );
        let removed = scheduler.remove_thread(other).unwrap();
        assert_eq!(removed.state(), ThreadState::Active);
        assert_eq!(process.threads(), vec![boot]);
        assert_eq!(
            scheduler.remove_thread(other).unwrap_err(),
            SchedulerError::ThreadNotFound { thread: other }
        );
    }

    #[test]
    fn test_lock_defers_yield_until_outermost_unlock() {
        let scheduler = scheduler();
        scheduler.lock();
        scheduler.lock();
        scheduler.yield_now();
        scheduler.yield_now();
        assert_eq!(scheduler.deferred_yields(), 2);

        scheduler.unlock();
        assert_eq!(scheduler.deferred_yields(), 2);
        scheduler.unlock();
        assert_eq!(scheduler.deferred_yields(), 0);

        // Unbalanced unlocks are ignored.
        scheduler.unlock();
        scheduler.yield_now();
        assert_eq!(scheduler.deferred_yields(), 0);
    }

    #[test]
    fn test_preemption_guard() {
        let scheduler = scheduler();
        {
            let _guard = PreemptionGuard::new(&scheduler);
            scheduler.yield_now();
            assert_eq!(scheduler.deferred_yields(), 1);
        }
        assert_eq!(scheduler.deferred_yields(), 0);
    }

    #[test]
    fn test_primed_threads_point_into_their_stack() {
        let scheduler = scheduler();
        let pages: Arc<dyn PageAllocator> = Arc::new(test_pool(2));
        let process = Processes::new().create("kernel", 1);
        extern "C" fn work() {}

        let thread = process.create_kernel_thread(pages.as_ref(), work).unwrap();
        let id = scheduler.add_thread(thread);
        let (sp, inside) = scheduler
            .with_thread(id, |thread| {
                let sp = thread.context().stack_pointer();
                (sp, thread.stack().map_or(false, |page| page.contains(sp)))
            })
            .unwrap();
        assert_ne!(sp, 0);
        assert!(inside);
    }
}
