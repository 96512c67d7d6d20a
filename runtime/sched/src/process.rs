//! Processes as lightweight thread groups
//!
//! A process carries a name, a priority that scales every one of its
//! threads, and the list of threads currently registered with a scheduler.
//! There is no address-space isolation, and processes are never reclaimed:
//! the table only grows.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use keel_drivers::sync::IrqSpinlock;
use log::debug;

use crate::memory::PageAllocator;
use crate::thread::{Thread, ThreadEntry, ThreadId};
use crate::{Result, SchedulerError};

pub const DEFAULT_PROCESS_PRIORITY: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process#{}", self.0)
    }
}

pub struct Process {
    id: ProcessId,
    name: String,
    priority: AtomicU32,
    threads: IrqSpinlock<Vec<ThreadId>>,
}

impl Process {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Change the priority of every thread in the process at once
    ///
    /// Schedulers cache the summed weight of their active threads; call
    /// `Scheduler::priorities_changed` afterwards.
    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// Threads of this process currently known to a scheduler
    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// A new thread with its own stack page, starting at `entry`
    ///
    /// The thread does not run until it is added to a scheduler.
    pub fn create_kernel_thread(
        self: &Arc<Self>,
        pages: &dyn PageAllocator,
        entry: ThreadEntry,
    ) -> Result<Thread> {
        let stack = pages.allocate_page().ok_or(SchedulerError::OutOfPages)?;
        debug!("{}: new kernel thread, stack {:?}", self.name, stack);
        Ok(Thread::new(self.clone(), Some(stack), Some(entry)))
    }

    /// A thread describing the flow of execution that is already running
    ///
    /// Used to register the boot flow with a scheduler; it has no stack page
    /// of its own.
    pub fn create_current_thread(self: &Arc<Self>) -> Thread {
        Thread::new(self.clone(), None, None)
    }

    pub(crate) fn attach(&self, thread: ThreadId) {
        self.threads.lock().push(thread);
    }

    pub(crate) fn detach(&self, thread: ThreadId) {
        self.threads.lock().retain(|existing| *existing != thread);
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority())
            .finish()
    }
}

/// Table of every process created since boot
#[derive(Default)]
pub struct Processes {
    table: IrqSpinlock<Vec<Arc<Process>>>,
}

impl Processes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: &str, priority: u32) -> Arc<Process> {
        let mut table = self.table.lock();
        let process = Arc::new(Process {
            id: ProcessId(table.len() as u32),
            name: name.to_string(),
            priority: AtomicU32::new(priority),
            threads: IrqSpinlock::new(Vec::new()),
        });
        table.push(process.clone());
        debug!("PROCESS {} {} (priority {})", process.id, name, priority);
        process
    }

    pub fn get(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.table.lock().get(id.index()).cloned()
    }

    pub fn find(&self, name: &str) -> Option<Arc<Process>> {
        self.table.lock().iter().find(|process| process.name == name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Process>> {
        self.table.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
