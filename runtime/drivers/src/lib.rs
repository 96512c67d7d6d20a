//! Driver Framework - lifecycle, capability lookup and resource arbitration
//!
//! # Purpose
//! Every piece of hardware (and a few pieces of software, such as the thread
//! scheduler) is represented by a long-lived [`Driver`]. This crate decides
//! which drivers run, which hardware they own, and who gets told when one of
//! them goes away.
//!
//! # Integration Points
//! - Depends on: nothing but `alloc` and an interrupt mask per architecture
//! - Provides to: boot code, interrupt dispatch, the scheduler crate
//! - Entry points: [`Registry::install`], [`Registry::find_and_activate`],
//!   [`Registry::on_irq`], [`Registry::on_interrupt`]
//!
//! # Architecture
//! - [`DriverType`] tags form an "is-a" chain used to filter the registry.
//! - Each driver publishes trait objects for the capabilities it implements
//!   ([`Capabilities`]); callers ask for `dyn Timer`, never for a concrete type.
//! - A per-driver [`ResourceLedger`] records claimed memory, IRQ lines,
//!   interrupt vectors, PCI functions and I/O ports. Exclusive resources are
//!   checked against every other active driver under one lock.
//! - [`DriverReference`] observers are zeroed, and their callbacks run, when
//!   the target driver stops or fails.
//!
//! # Testing Strategy
//! - Unit tests: interval merge/split, type chains, bitmaps
//! - Integration tests: lifecycle, arbitration conflicts, cascade shutdown

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

use alloc::string::String;
use thiserror::Error;

mod api;
mod capability;
mod driver;
mod ledger;
mod lifecycle;
mod reference;
mod registry;
mod summary;
pub mod sync;

pub use api::DriverApi;
pub use capability::{
    Capabilities, Capability, DriverType, InterruptController, Timer, DRIVER, HARDWARE,
    INTERRUPT_CONTROLLER, SOFTWARE, TIMER,
};
pub use driver::Driver;
pub use ledger::{
    Bitmap256, IrqMask, LifecycleState, MemoryRange, PciAddress, ResourceKinds, ResourceLedger,
    Startup,
};
pub use reference::{AutomaticDriverReference, DriverReference};
pub use registry::{DriverEvent, DriverHandle, DriverId, Registry};
pub use summary::DriverSummary;

/// Errors reported by the driver framework
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Resource already in use by {owner}")]
    ResourceInUse { owner: &'static str },

    #[error("Resource not subscribed")]
    ResourceNotFound,

    #[error("Unable to start {driver}: {reason}")]
    StartFailed { driver: &'static str, reason: String },

    #[error("{driver} cannot be stopped")]
    StopRefused { driver: &'static str },

    #[error("No startable {capability} driver")]
    DependencyMissing { capability: &'static str },
}

impl DriverError {
    /// Shorthand for hooks reporting why they could not start
    pub fn start_failed(driver: &'static str, reason: impl Into<String>) -> Self {
        DriverError::StartFailed {
            driver,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = core::result::Result<T, DriverError>;
