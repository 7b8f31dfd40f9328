//! # Firmware-to-Kernel Handoff
//!
//! Ties the boot crates together into the sequence a UEFI loader runs right
//! before jumping into the kernel:
//!
//! 1. reserve room for the phase-1 page-table copy while allocation still works,
//! 2. [`exit_boot_services`] with a fresh memory-map key,
//! 3. move the page tables out of boot-services memory,
//! 4. relocate runtime services into the kernel's window (best effort),
//! 5. move the page tables into the safe pool,
//! 6. normalize the memory map for the kernel.
//!
//! Firmware is reached only through [`BootServices`] and [`FirmwareRuntime`]
//! values; terminating boot services consumes the former and yields the
//! latter, so nothing can call into boot services after the exit.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod config;
mod error;
mod exit;
mod handoff;

pub use crate::config::{DEFAULT_RTS_SIZE, HandoffConfig};
pub use crate::error::{ConfigError, HandoffError};
pub use crate::exit::{BootServices, FirmwareRuntime, MAX_EXIT_ATTEMPTS, exit_boot_services};
pub use crate::handoff::{KernelHandoff, run_handoff};
