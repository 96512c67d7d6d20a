//! Thread Scheduler - threads, processes and preemptive round robin
//!
//! # Purpose
//! Multiplexes kernel threads onto the CPU. The scheduler is itself a driver:
//! it is found through the driver registry by capability (`dyn Scheduler`),
//! claims a timer on start, and is failed automatically if that timer goes
//! away.
//!
//! # Integration Points
//! - Depends on: `keel-drivers` (registry, `Timer` capability, locking)
//! - Provides to: boot code and the timer interrupt path
//! - Allocator boundary: [`PageAllocator`] supplies one page per thread stack
//!
//! # Architecture
//! - Threads live in a generation-checked arena; each live thread is a member
//!   of exactly one of the active, sleeping, paused or pending-free lists.
//! - [`CpuScheduler`] owns those lists behind one interrupt-masking lock and
//!   asks a [`SchedulingPolicy`] how long each slice should be.
//! - The register swap itself is one unsafe function per architecture in
//!   [`arch`].
//!
//! # Testing Strategy
//! - Unit tests: list membership, slice arithmetic, page pool
//! - Integration tests: yield ordering, sleeping, deferred yields, reaping
//!   (hosted build, context switches are no-ops)

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod arch;
mod memory;
mod policy;
mod process;
mod scheduler;
mod table;
mod thread;

pub use memory::{Page, PageAllocator, PagePool, PAGE_SIZE};
pub use policy::{FixedInterval, SchedulingPolicy, WeightedConfig, WeightedRoundRobin};
pub use process::{Process, ProcessId, Processes, DEFAULT_PROCESS_PRIORITY};
pub use scheduler::{CpuScheduler, PreemptionGuard, Scheduler, SCHEDULER};
pub use table::ThreadCounts;
pub use thread::{Thread, ThreadEntry, ThreadId, ThreadState, DEFAULT_THREAD_PRIORITY};

use thiserror::Error;

/// Errors reported by thread and process operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Out of pages for thread stacks")]
    OutOfPages,

    #[error("Thread {thread} not found")]
    ThreadNotFound { thread: ThreadId },

    #[error("Thread {thread} is running")]
    ThreadRunning { thread: ThreadId },

    #[error("Scheduler is not running")]
    NotStarted,
}

pub type Result<T> = core::result::Result<T, SchedulerError>;
