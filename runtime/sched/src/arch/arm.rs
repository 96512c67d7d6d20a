//! ARM32 context switch
//!
//! AAPCS callee-saved registers are r4-r11; `push {r4-r11, lr}` stores them
//! lowest register first, giving a nine-word frame with lr on top. A primed
//! frame has the entry point in r4, the exit hook in r5, the exit data in r6
//! and `keel_thread_start` as lr.

use core::arch::{asm, global_asm};

use super::{write_frame, ExitHook, SavedContext};
use crate::memory::Page;
use crate::thread::ThreadEntry;

const FRAME_WORDS: usize = 9;

global_asm!(
    "
    .section .text
    .global keel_switch_context
    .type keel_switch_context, %function
keel_switch_context:
    @ r0 = &mut from.sp, r1 = &to.sp
    push {{r4-r11, lr}}
    mov r2, sp
    str r2, [r0]
    ldr r2, [r1]
    mov sp, r2
    pop {{r4-r11, pc}}
    .size keel_switch_context, .-keel_switch_context

    .global keel_thread_start
    .type keel_thread_start, %function
keel_thread_start:
    mov r0, r4
    mov r1, r5
    mov r2, r6
    bl keel_thread_bootstrap
    udf #0
    .size keel_thread_start, .-keel_thread_start
    "
);

extern "C" {
    fn keel_switch_context(from: *mut SavedContext, to: *const SavedContext);
    fn keel_thread_start();
}

pub(super) fn prime(stack: &mut Page, entry: ThreadEntry, exit: ExitHook, data: *const ()) -> usize {
    let mut frame = [0usize; FRAME_WORDS];
    frame[0] = entry as usize;
    frame[1] = exit as usize;
    frame[2] = data as usize;
    frame[8] = keel_thread_start as usize;

    let base = (stack.top() & !7) - FRAME_WORDS * 4;
    write_frame(stack, base, &frame)
}

pub(super) unsafe fn switch_context(from: *mut SavedContext, to: *const SavedContext) {
    keel_switch_context(from, to)
}

pub(super) fn idle_wait() {
    // SAFETY: wfi only pauses the core until the next interrupt.
    unsafe { asm!("wfi", options(nomem, nostack, preserves_flags)) };
}
