//! x86_64 context switch
//!
//! System V callee-saved registers are rbp, rbx and r12-r15. The switch
//! pushes them below the return address left by `call`:
//!
//! Offset | Contents
//! -------|---------
//! 0x00   | r15
//! 0x08   | r14   (exit data on a primed frame)
//! 0x10   | r13   (exit hook)
//! 0x18   | r12   (entry point)
//! 0x20   | rbx
//! 0x28   | rbp
//! 0x30   | return address (`keel_thread_start` on a primed frame)

use core::arch::{asm, global_asm};

use super::{write_frame, ExitHook, SavedContext};
use crate::memory::Page;
use crate::thread::ThreadEntry;

const FRAME_WORDS: usize = 7;

global_asm!(
    "
    .section .text
    .global keel_switch_context
    .type keel_switch_context, @function
keel_switch_context:
    // rdi = &mut from.sp, rsi = &to.sp
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15

    mov [rdi], rsp
    mov rsp, [rsi]

    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret
    .size keel_switch_context, .-keel_switch_context

    .global keel_thread_start
    .type keel_thread_start, @function
keel_thread_start:
    mov rdi, r12
    mov rsi, r13
    mov rdx, r14
    call keel_thread_bootstrap
    ud2
    .size keel_thread_start, .-keel_thread_start
    "
);

extern "C" {
    fn keel_switch_context(from: *mut SavedContext, to: *const SavedContext);
    fn keel_thread_start();
}

pub(super) fn prime(stack: &mut Page, entry: ThreadEntry, exit: ExitHook, data: *const ()) -> usize {
    let frame = [
        0,
        data as usize,
        exit as usize,
        entry as usize,
        0,
        0,
        keel_thread_start as usize,
    ];

    // After the final `ret` the stack must be 16-byte aligned for the `call`.
    let base = (stack.top() & !15) - 16 - FRAME_WORDS * 8;
    write_frame(stack, base, &frame)
}

pub(super) unsafe fn switch_context(from: *mut SavedContext, to: *const SavedContext) {
    keel_switch_context(from, to)
}

pub(super) fn idle_wait() {
    // SAFETY: sti; hlt sleeps until the next interrupt, which is already
    // allowed by the time the idle thread runs.
    unsafe { asm!("sti", "hlt", options(nomem, nostack)) };
}
