//! Context switching
//!
//! Each architecture provides one assembly routine, `keel_switch_context`,
//! with the same contract:
//!
//! 1. Push the callee-saved registers and the return address onto the
//!    current stack.
//! 2. Store the resulting stack pointer into `from.sp`.
//! 3. Load `to.sp`, pop the callee-saved registers, and return into the
//!    incoming thread.
//!
//! A new thread's stack is primed with a frame that "returns" into
//! `keel_thread_start`, which moves the entry point, exit hook and exit data
//! out of callee-saved registers into argument registers and calls
//! [`keel_thread_bootstrap`].
//!
//! Hosted builds have no real switch: priming lays out the same three words
//! at the top of the stack so tests can inspect or run them, and
//! `switch_context` returns immediately.

use core::mem::size_of;

use static_assertions::const_assert_eq;

use crate::memory::Page;
use crate::thread::ThreadEntry;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod aarch64;
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use aarch64 as imp;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use x86_64 as imp;

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod arm;
#[cfg(all(target_arch = "arm", target_os = "none"))]
use arm as imp;

#[cfg(not(all(
    target_os = "none",
    any(target_arch = "aarch64", target_arch = "x86_64", target_arch = "arm")
)))]
mod hosted;
#[cfg(not(all(
    target_os = "none",
    any(target_arch = "aarch64", target_arch = "x86_64", target_arch = "arm")
)))]
use hosted as imp;
#[cfg(not(all(
    target_os = "none",
    any(target_arch = "aarch64", target_arch = "x86_64", target_arch = "arm")
)))]
pub use hosted::run_primed;

/// Called once a thread's entry function returns, with the data pointer
/// given to [`prime`]
pub type ExitHook = extern "C" fn(*const ());

/// Everything needed to resume a switched-out thread
///
/// The registers themselves live on the thread's stack; only the stack
/// pointer is kept here. The assembly reads and writes `sp` at offset 0.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedContext {
    sp: usize,
}

const_assert_eq!(size_of::<SavedContext>(), size_of::<usize>());
const_assert_eq!(core::mem::offset_of!(SavedContext, sp), 0);

impl SavedContext {
    pub fn stack_pointer(&self) -> usize {
        self.sp
    }
}

/// Lay out a first-run frame on `stack` so that switching to `context`
/// starts `entry`, then calls `exit(data)`
pub fn prime(
    context: &mut SavedContext,
    stack: &mut Page,
    entry: ThreadEntry,
    exit: ExitHook,
    data: *const (),
) {
    context.sp = imp::prime(stack, entry, exit, data);
}

/// Save the running thread into `from` and resume `to`
///
/// Returns when something later switches back to `from`.
///
/// # Safety
/// - Interrupts must be masked, and the caller must not hold any lock the
///   incoming thread could try to take.
/// - `from` must stay valid until it is resumed; `to` must hold a stack
///   pointer produced by an earlier switch or by [`prime`], whose stack is
///   still alive.
#[inline(never)]
pub unsafe fn switch_context(from: *mut SavedContext, to: *const SavedContext) {
    imp::switch_context(from, to)
}

/// Wait for the next interrupt
pub fn idle_wait() {
    imp::idle_wait()
}

/// Copy `words` into the stack page, starting at address `base`
fn write_frame(stack: &mut Page, base: usize, words: &[usize]) -> usize {
    debug_assert!(stack.contains(base));
    debug_assert!(base + words.len() * size_of::<usize>() <= stack.top());
    let frame = base as *mut usize;
    for (index, word) in words.iter().enumerate() {
        // SAFETY: the frame lies inside the page and `stack` is borrowed
        // exclusively.
        unsafe { frame.add(index).write(*word) };
    }
    base
}

/// First Rust code a new thread runs
///
/// The switch that brought us here was made inside a critical section owned
/// by the thread that switched away; release it before running the entry.
#[cfg(all(
    target_os = "none",
    any(target_arch = "aarch64", target_arch = "x86_64", target_arch = "arm")
))]
#[no_mangle]
extern "C" fn keel_thread_bootstrap(entry: ThreadEntry, exit: ExitHook, data: *const ()) -> ! {
    // SAFETY: this is the first thing a freshly switched-to thread does.
    unsafe { keel_drivers::sync::CriticalSection::leave_inherited() };
    entry();
    exit(data);
    loop {
        idle_wait();
    }
}
