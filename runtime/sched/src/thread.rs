//! Thread control blocks

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use keel_drivers::DriverId;

use crate::arch::SavedContext;
use crate::memory::Page;
use crate::process::Process;

/// Entry point of a kernel thread
pub type ThreadEntry = extern "C" fn();

/// Priority given to threads unless the creator says otherwise
pub const DEFAULT_THREAD_PRIORITY: u32 = 100;

/// Generation-checked handle to a thread slot
///
/// A handle to a reaped thread never aliases the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Active,
    Sleeping,
    Paused,
    Terminated,
}

type DeletedCallback = Box<dyn FnOnce() + Send>;

/// A schedulable thread of execution
///
/// Built by [`Process::create_kernel_thread`] or
/// [`Process::create_current_thread`], then handed to a scheduler, which
/// owns it until it is reaped.
pub struct Thread {
    process: Arc<Process>,
    priority: u32,
    // Boxed so the address handed to the context switch survives table growth.
    pub(crate) context: Box<SavedContext>,
    pub(crate) stack: Option<Page>,
    entry: Option<ThreadEntry>,
    pub(crate) state: ThreadState,
    pub(crate) wake_at: u64,
    pub(crate) scheduler: Option<DriverId>,
    on_deleted: Vec<DeletedCallback>,
}

impl Thread {
    pub(crate) fn new(process: Arc<Process>, stack: Option<Page>, entry: Option<ThreadEntry>) -> Self {
        Self {
            process,
            priority: DEFAULT_THREAD_PRIORITY,
            context: Box::new(SavedContext::default()),
            stack,
            entry,
            state: ThreadState::Active,
            wake_at: 0,
            scheduler: None,
            on_deleted: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    /// Scheduling weight: thread priority scaled by its process priority
    pub fn weight(&self) -> u64 {
        u64::from(self.priority) * u64::from(self.process.priority())
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Deadline of the current sleep, in timer microseconds
    pub fn wake_at(&self) -> u64 {
        self.wake_at
    }

    pub fn entry(&self) -> Option<ThreadEntry> {
        self.entry
    }

    pub fn stack(&self) -> Option<&Page> {
        self.stack.as_ref()
    }

    pub fn context(&self) -> &SavedContext {
        &self.context
    }

    /// Scheduler driver that owns this thread
    pub fn scheduler(&self) -> Option<DriverId> {
        self.scheduler
    }

    /// Run `callback` when the thread is reaped, before its stack is freed
    pub fn on_deleted(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_deleted.push(Box::new(callback));
    }

    pub(crate) fn run_deleted_callbacks(&mut self) {
        for callback in self.on_deleted.drain(..) {
            callback();
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("process", &self.process.name())
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("wake_at", &self.wake_at)
            .field("stack", &self.stack)
            .finish()
    }
}
