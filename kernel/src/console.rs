//! Minimal character sinks for kernel output
//!
//! A console is not a driver: it has no lifecycle and claims no resources,
//! so it can be used before the registry exists. Full UART drivers belong in
//! the driver registry.

use core::fmt;
use core::ptr;

/// Character sink for kernel output
pub trait Console: Send + Sync {
    /// Write one byte, blocking until the device accepts it
    fn putc(&self, c: u8);

    /// Write a string, expanding `\n` to CRLF for terminals
    fn puts(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r');
            }
            self.putc(byte);
        }
    }
}

/// Adapter so `write!` can target any console
pub struct ConsoleWriter<'a> {
    console: &'a dyn Console,
}

impl<'a> ConsoleWriter<'a> {
    pub const fn new(console: &'a dyn Console) -> Self {
        Self { console }
    }
}

impl fmt::Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.console.puts(s);
        Ok(())
    }
}

/// Discards everything
pub struct NullConsole;

impl Console for NullConsole {
    #[inline(always)]
    fn putc(&self, _c: u8) {}

    #[inline(always)]
    fn puts(&self, _s: &str) {}
}

const PL011_DR: usize = 0x00;
const PL011_FR: usize = 0x18;
const PL011_FR_TXFF: u32 = 1 << 5;

/// Polled PL011 UART transmitter
///
/// Assumes firmware already configured baud rate and framing.
pub struct Pl011Console {
    mmio_base: usize,
}

impl Pl011Console {
    /// The MMIO window at `mmio_base` must be mapped before the first write.
    pub const fn new(mmio_base: usize) -> Self {
        Self { mmio_base }
    }

    fn tx_full(&self) -> bool {
        let fr = (self.mmio_base + PL011_FR) as *const u32;
        // SAFETY: the caller of `new` guarantees the register window is mapped.
        unsafe { ptr::read_volatile(fr) & PL011_FR_TXFF != 0 }
    }
}

impl Console for Pl011Console {
    fn putc(&self, c: u8) {
        while self.tx_full() {
            core::hint::spin_loop();
        }
        let dr = (self.mmio_base + PL011_DR) as *mut u32;
        // SAFETY: same mapped window as `tx_full`; DR is a 32-bit register.
        unsafe { ptr::write_volatile(dr, c as u32) };
    }
}
