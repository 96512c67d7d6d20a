//! Keel kernel context
//!
//! Ties the driver registry and the thread scheduler together behind one
//! [`KernelContext`] handle. Boot code builds the context, installs the
//! platform's drivers and calls [`KernelContext::boot`]; interrupt entry
//! points then route through the same handle.
//!
//! # Components
//! - [`config`]: compile-time selection of the scheduling policy, log level
//!   and console
//! - [`console`]: minimal character sinks for kernel output
//! - [`logger`]: `log` backend writing to a console
//! - [`hosted`]: simulated timer, interrupt controller and console used to run
//!   the kernel on a development host

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

use keel_drivers::DriverError;
use keel_sched::SchedulerError;
use thiserror::Error;

pub mod config;
pub mod console;
mod context;
pub mod hosted;
pub mod logger;

pub use context::KernelContext;

/// Errors surfaced by kernel bring-up and thread creation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("No scheduler could be started")]
    NoScheduler,
}

pub type Result<T> = core::result::Result<T, KernelError>;
