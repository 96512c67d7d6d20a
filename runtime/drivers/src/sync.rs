//! Interrupt-safe locking
//!
//! [`IrqSpinlock`] masks interrupts on the current core before it spins, and
//! restores the previous mask when the guard drops. Masking nests through
//! [`CriticalSection`], so only the outermost exit re-enables interrupts.
//!
//! On hosted targets (unit tests, simulators) masking is a no-op and the lock
//! degrades to a plain `spin::Mutex`.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Interrupt mask control for the current core
pub mod interrupts {
    /// Mask interrupts, returning whether they were enabled beforehand
    #[inline]
    pub fn disable() -> bool {
        imp::disable()
    }

    /// Unmask interrupts
    ///
    /// # Safety
    /// Callers must not be holding any state that an interrupt handler could
    /// observe half-updated.
    #[inline]
    pub unsafe fn enable() {
        imp::enable()
    }

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    mod imp {
        use core::arch::asm;

        const DAIF_I: u64 = 1 << 7;

        pub fn disable() -> bool {
            let daif: u64;
            // SAFETY: reading DAIF and setting the I bit has no memory effects.
            unsafe {
                asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags));
                asm!("msr daifset, #2", options(nomem, nostack, preserves_flags));
            }
            daif & DAIF_I == 0
        }

        pub unsafe fn enable() {
            asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags));
        }
    }

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    mod imp {
        use core::arch::asm;

        const RFLAGS_IF: u64 = 1 << 9;

        pub fn disable() -> bool {
            let rflags: u64;
            // SAFETY: pushfq/pop only touch the stack slot they allocate.
            unsafe {
                asm!("pushfq", "pop {}", "cli", out(reg) rflags, options(nomem));
            }
            rflags & RFLAGS_IF != 0
        }

        pub unsafe fn enable() {
            asm!("sti", options(nomem, nostack));
        }
    }

    #[cfg(all(target_arch = "arm", target_os = "none"))]
    mod imp {
        use core::arch::asm;

        const CPSR_I: u32 = 1 << 7;

        pub fn disable() -> bool {
            let cpsr: u32;
            // SAFETY: reading CPSR and masking IRQs has no memory effects.
            unsafe {
                asm!("mrs {}, cpsr", out(reg) cpsr, options(nomem, nostack, preserves_flags));
                asm!("cpsid i", options(nomem, nostack, preserves_flags));
            }
            cpsr & CPSR_I == 0
        }

        pub unsafe fn enable() {
            asm!("cpsie i", options(nomem, nostack, preserves_flags));
        }
    }

    #[cfg(not(all(
        target_os = "none",
        any(target_arch = "aarch64", target_arch = "x86_64", target_arch = "arm")
    )))]
    mod imp {
        pub fn disable() -> bool {
            false
        }

        pub unsafe fn enable() {}
    }
}

static DEPTH: AtomicUsize = AtomicUsize::new(0);
static RESTORE: AtomicBool = AtomicBool::new(false);

/// Nesting interrupt-masked region on the current core
///
/// Entering masks interrupts; leaving the outermost section restores
/// whatever mask was in place when the first section was entered.
#[must_use = "interrupts are unmasked again as soon as the section is dropped"]
pub struct CriticalSection {
    _private: (),
}

impl CriticalSection {
    pub fn enter() -> Self {
        let were_enabled = interrupts::disable();
        if DEPTH.fetch_add(1, Ordering::Acquire) == 0 {
            RESTORE.store(were_enabled, Ordering::Relaxed);
        }
        CriticalSection { _private: () }
    }

    /// Current nesting depth on this core
    pub fn depth() -> usize {
        DEPTH.load(Ordering::Relaxed)
    }

    /// Leave a section that was entered by a different thread of execution
    ///
    /// A freshly created thread starts running inside the section its
    /// predecessor held across the context switch; its first act is to
    /// release that section.
    ///
    /// # Safety
    /// Must only be called once per inherited section, from the start of a
    /// newly switched-to thread.
    pub unsafe fn leave_inherited() {
        leave();
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        leave();
    }
}

fn leave() {
    if DEPTH.fetch_sub(1, Ordering::Release) == 1 && RESTORE.load(Ordering::Relaxed) {
        // SAFETY: the outermost section is closing; nothing is mid-update.
        unsafe { interrupts::enable() };
    }
}

/// Spin lock that masks interrupts while held
pub struct IrqSpinlock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Mask interrupts, then spin until the lock is ours
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let section = CriticalSection::enter();
        IrqSpinlockGuard {
            guard: self.inner.lock(),
            _section: section,
        }
    }

    pub fn try_lock(&self) -> Option<IrqSpinlockGuard<'_, T>> {
        let section = CriticalSection::enter();
        let guard = self.inner.try_lock()?;
        Some(IrqSpinlockGuard {
            guard,
            _section: section,
        })
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for IrqSpinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Guard for [`IrqSpinlock`]; unlocks first, then unmasks
pub struct IrqSpinlockGuard<'a, T> {
    // Field order matters: the mutex guard drops before the section.
    guard: spin::MutexGuard<'a, T>,
    _section: CriticalSection,
}

impl<T> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_round_trip() {
        let lock = IrqSpinlock::new(5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.lock(), 6);
        assert_eq!(lock.into_inner(), 6);
    }

    #[test]
    fn test_hosted_masking_is_inert() {
        assert!(!interrupts::disable());
    }
}
