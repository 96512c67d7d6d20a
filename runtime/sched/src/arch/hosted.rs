//! Hosted stand-in: no register switch, same frame contract

use core::mem::size_of;

use super::{write_frame, ExitHook, SavedContext};
use crate::memory::Page;
use crate::thread::ThreadEntry;

const FRAME_WORDS: usize = 3;

pub(super) fn prime(stack: &mut Page, entry: ThreadEntry, exit: ExitHook, data: *const ()) -> usize {
    let base = (stack.top() & !15) - FRAME_WORDS * size_of::<usize>();
    write_frame(stack, base, &[entry as usize, exit as usize, data as usize])
}

pub(super) unsafe fn switch_context(_from: *mut SavedContext, _to: *const SavedContext) {}

pub(super) fn idle_wait() {
    core::hint::spin_loop();
}

/// Run a primed thread to completion on the caller's stack
///
/// # Safety
/// `stack_pointer` must come from [`super::prime`] and its stack page must
/// still be allocated.
pub unsafe fn run_primed(stack_pointer: usize) {
    let frame = stack_pointer as *const usize;
    let entry: ThreadEntry = core::mem::transmute::<usize, ThreadEntry>(frame.read());
    let exit: ExitHook = core::mem::transmute::<usize, ExitHook>(frame.add(1).read());
    let data = frame.add(2).read() as *const ();
    entry();
    exit(data);
}
