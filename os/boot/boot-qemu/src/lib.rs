//! # QEMU Debug-Port Output
//!
//! Best-effort character output to QEMU's debug console (`-debugcon`), which
//! keeps working after UEFI boot services (and with them the firmware console)
//! have been torn down. The handoff relies on this to report what happened
//! between `ExitBootServices` and the kernel jump.
//!
//! ```text
//! qemu_trace! ─► QemuSink (fmt::Write) ─► out 0x402 ─► -debugcon stdio|file:...
//! ```
//!
//! With the `enabled` feature off, [`qemu_trace!`] compiles to nothing and no
//! port I/O is emitted, which is what real hardware builds want.
//!
//! ```rust,ignore
//! use boot_qemu::qemu_trace;
//! qemu_trace!("relocated page tables to {:#x}\n", root);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// The port number for QEMU's debug port.
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to QEMU's debug port.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        unsafe { outb(QEMU_DEBUG_PORT, c) }
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nomem, nostack, preserves_flags)
            );
        }
    }

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best-effort; nobody is listening for errors on a debug port.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub const fn qemu_write(_: fmt::Arguments) {}
}

/// `format!`-style output to the QEMU debug port. No allocation.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
