//! # UEFI Loader: Firmware-to-Kernel Handoff
//!
//! This UEFI application drives the handoff crates against real firmware. It
//! leaves the machine in the state a kernel expects to find it in: boot
//! services terminated, page tables copied out of firmware memory, runtime
//! services relocated into the kernel's window where the platform allows it,
//! and a normalized memory map.
//!
//! ## Boot Process
//!
//! ```text
//! UEFI Firmware Boot
//!         ↓
//! ┌─────────────────────────────────────────────┐
//! │              UEFI Loader                    │
//! ├─────────────────────────────────────────────┤
//! │  1. Environment Setup                       │
//! │     • Initialize logging                    │
//! │     • Parse load options into the config    │
//! │     • Look up platform quirks               │
//! │  2. Reservations                            │
//! │     • Page pools for use after exit         │
//! │     • Capture CR3 and the SEV C-bit         │
//! │  3. Handoff (boot-handoff)                  │
//! │     • Phase-1 page-table reservation        │
//! │     • ExitBootServices with retries         │
//! │     • Phase-1 copy, runtime services switch │
//! │     • Phase-2 copy into the safe pool       │
//! │     • Memory map normalization              │
//! │  4. Report                                  │
//! │     • Trace the result to the debug port    │
//! └─────────────────────────────────────────────┘
//!         ↓
//! Kernel entry (not part of this loader)
//! ```
//!
//! ## Load Options
//!
//! Whitespace-separated `key=value` pairs, see
//! [`HandoffConfig::apply_options`]:
//!
//! ```text
//! rtsbase=0xffffff0000000000 rtssize=0x8000000000 rtstest=1
//! ```
//!
//! ## After `ExitBootServices`
//!
//! The firmware console and the pool allocator are gone. The logger keeps
//! writing to the QEMU debug port (feature `qemu`) and heap allocations fail,
//! so everything the handoff needs afterwards is reserved beforehand.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![no_main]
#![allow(unsafe_code)]
extern crate alloc;

mod firmware;
mod logger;
mod memory;
mod systab;
mod tracing;
mod vmem;

use crate::firmware::BootToken;
use crate::logger::UefiLogger;
use crate::memory::LoaderAllocator;
use crate::tracing::trace_handoff;
use crate::vmem::{Cr3Root, IdentityMapper};
use alloc::string::{String, ToString};
use boot_addresses::PhysicalAddress;
use boot_handoff::{HandoffConfig, HandoffError, run_handoff};
use boot_mmap::MemoryMapError;
use boot_quirks::{PlatformId, QuirkDatabase};
use log::{error, info, warn};
use uefi::boot;
use uefi::prelude::*;
use uefi::proto::loaded_image::LoadedImage;

#[entry]
fn efi_main() -> Status {
    if uefi::helpers::init().is_err() {
        return Status::UNSUPPORTED;
    }
    if UefiLogger::init().is_err() {
        return Status::ABORTED;
    }

    info!("UEFI Loader reporting to QEMU");

    let config = load_config();
    let vendor = uefi::system::firmware_vendor().to_string();
    let platform = PlatformId {
        firmware_vendor: Some(vendor.as_str()),
        ..PlatformId::default()
    };
    let quirks = QuirkDatabase::builtin().lookup(&platform);
    info!("firmware '{vendor}', quirks {quirks:?}");

    let mut alloc = match LoaderAllocator::reserve() {
        Ok(alloc) => alloc,
        Err(e) => {
            error!("cannot reserve page pools: {:?}", e.status());
            return e.status();
        }
    };
    let mut root = Cr3Root::current();
    let system_table = uefi::table::system_table_raw()
        .map_or(PhysicalAddress::zero(), |st| PhysicalAddress::from_ptr(st.as_ptr()));

    // SAFETY: boot services are active and this is the only token.
    let Some(boot) = (unsafe { BootToken::acquire() }) else {
        error!("boot services table is missing");
        return Status::UNSUPPORTED;
    };

    info!("Exiting boot services ...");
    let handoff = match run_handoff(boot, &config, quirks, &IdentityMapper, &mut root, &mut alloc)
    {
        Ok(handoff) => handoff,
        Err(e) => {
            // Boot services may already be gone; there is no one to return to.
            error!("handoff failed: {e}");
            halt(status_of(&e));
        }
    };

    info!("Boot services exited, we're now flying by instruments.");
    trace_handoff(&handoff, system_table);

    // The map and tables belong to the kernel from here on.
    core::mem::forget(handoff);
    halt(Status::SUCCESS)
}

/// Defaults, overridden by the image's load options.
fn load_config() -> HandoffConfig {
    let mut config = HandoffConfig::default();
    let Some(options) = load_options() else {
        return config;
    };
    if let Err(e) = config.apply_options(&options) {
        warn!("ignoring load options '{options}': {e}");
        return HandoffConfig::default();
    }
    config
}

fn load_options() -> Option<String> {
    let image = boot::open_protocol_exclusive::<LoadedImage>(boot::image_handle()).ok()?;
    let options = image.load_options_as_cstr16().ok()?;
    Some(options.to_string())
}

fn status_of(err: &HandoffError) -> Status {
    match err {
        HandoffError::MemoryMap(MemoryMapError::Firmware(status))
        | HandoffError::ExitHandshake(status) => Status(status.to_raw()),
        HandoffError::MemoryMap(MemoryMapError::OutOfMemory { .. })
        | HandoffError::Relocation(_)
        | HandoffError::Rts(_) => Status::OUT_OF_RESOURCES,
        _ => Status::ABORTED,
    }
}

fn halt(status: Status) -> ! {
    info!("halting with {status:?}");
    loop {
        unsafe {
            core::arch::asm!("cli; hlt", options(nomem, nostack));
        }
    }
}
