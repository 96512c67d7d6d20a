//! Kernel configuration and component composition
//!
//! Everything here is fixed at compile time through cargo features:
//! - `sched-weighted` / `sched-fixed`: which [`SchedulingPolicy`] the kernel
//!   scheduler runs (weighted wins if both are enabled)
//! - `log-error` .. `log-trace`: the most verbose level the logger emits
//! - `console-pl011`: route kernel output to the PL011 UART instead of
//!   discarding it

use alloc::sync::Arc;

use keel_sched::{CpuScheduler, PageAllocator};
use log::LevelFilter;

use crate::console::Console;

#[cfg(not(all(feature = "sched-fixed", not(feature = "sched-weighted"))))]
pub type Policy = keel_sched::WeightedRoundRobin;

#[cfg(all(feature = "sched-fixed", not(feature = "sched-weighted")))]
pub type Policy = keel_sched::FixedInterval;

/// The scheduler driver this kernel is built with
pub type KernelScheduler = CpuScheduler<Policy>;

pub fn scheduler(pages: Arc<dyn PageAllocator>) -> KernelScheduler {
    CpuScheduler::new(Policy::default(), pages)
}

pub const MAX_LOG_LEVEL: LevelFilter = if cfg!(feature = "log-trace") {
    LevelFilter::Trace
} else if cfg!(feature = "log-debug") {
    LevelFilter::Debug
} else if cfg!(feature = "log-info") {
    LevelFilter::Info
} else if cfg!(feature = "log-warn") {
    LevelFilter::Warn
} else if cfg!(feature = "log-error") {
    LevelFilter::Error
} else {
    LevelFilter::Off
};

/// QEMU virt PL011 UART base address
#[cfg(feature = "console-pl011")]
pub const PL011_BASE: usize = 0x0900_0000;

#[cfg(feature = "console-pl011")]
static CONSOLE: crate::console::Pl011Console = crate::console::Pl011Console::new(PL011_BASE);

#[cfg(not(feature = "console-pl011"))]
static CONSOLE: crate::console::NullConsole = crate::console::NullConsole;

/// The console selected for this build
pub fn console() -> &'static dyn Console {
    &CONSOLE
}
