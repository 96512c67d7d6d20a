//! AArch64 context switch
//!
//! AAPCS64 callee-saved registers are x19-x29 plus the link register x30.
//! They are pushed as one 96-byte frame:
//!
//! Offset | Register
//! -------|---------
//! 0x00   | x19, x20
//! 0x10   | x21, x22
//! 0x20   | x23, x24
//! 0x30   | x25, x26
//! 0x40   | x27, x28
//! 0x50   | x29, x30
//!
//! A primed frame carries the entry point in x19, the exit hook in x20, the
//! exit data in x21, and `keel_thread_start` as x30.

use core::arch::{asm, global_asm};

use super::{write_frame, ExitHook, SavedContext};
use crate::memory::Page;
use crate::thread::ThreadEntry;

const FRAME_WORDS: usize = 12;

global_asm!(
    "
    .section .text
    .global keel_switch_context
    .type keel_switch_context, @function
    .balign 4
keel_switch_context:
    // x0 = &mut from.sp, x1 = &to.sp
    sub sp, sp, #96
    stp x19, x20, [sp, #0x00]
    stp x21, x22, [sp, #0x10]
    stp x23, x24, [sp, #0x20]
    stp x25, x26, [sp, #0x30]
    stp x27, x28, [sp, #0x40]
    stp x29, x30, [sp, #0x50]

    mov x9, sp
    str x9, [x0]
    ldr x9, [x1]
    mov sp, x9

    ldp x19, x20, [sp, #0x00]
    ldp x21, x22, [sp, #0x10]
    ldp x23, x24, [sp, #0x20]
    ldp x25, x26, [sp, #0x30]
    ldp x27, x28, [sp, #0x40]
    ldp x29, x30, [sp, #0x50]
    add sp, sp, #96
    ret
    .size keel_switch_context, .-keel_switch_context

    .global keel_thread_start
    .type keel_thread_start, @function
    .balign 4
keel_thread_start:
    mov x0, x19
    mov x1, x20
    mov x2, x21
    bl keel_thread_bootstrap
1:  wfe
    b 1b
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
    frame[11] = keel_thread_start as usize;

    let base = (stack.top() & !15) - FRAME_WORDS * 8;
    write_frame(stack, base, &frame)
}

pub(super) unsafe fn switch_context(from: *mut SavedContext, to: *const SavedContext) {
    keel_switch_context(from, to)
}

pub(super) fn idle_wait() {
    // SAFETY: wfi only pauses the core until the next interrupt.
    unsafe { asm!("wfi", options(nomem, nostack, preserves_flags)) };
}
