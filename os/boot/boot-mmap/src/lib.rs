//! # Firmware Memory Map
//!
//! Acquisition and stride-aware access to the UEFI memory map, the first step
//! of the firmware handoff.
//!
//! ## What you get
//! - [`get_memory_map`]: the size/double/re-query dance around
//!   `GetMemoryMap`, producing an owned [`MemoryMapSnapshot`].
//! - [`MemoryDescriptor`] in the 40-byte firmware layout, read through
//!   [`Descriptors`] and [`DescriptorTable`], which always advance by the
//!   firmware-reported stride.
//! - [`RamMap`]: "is this physical address RAM?" queries for the page-table
//!   cloner.
//! - [`HandoffRange`]: the normalized, kernel-facing view of each descriptor,
//!   written into the snapshot's trailing extra region.
//!
//! ## Memory layout of a snapshot
//!
//! ```text
//! 0          stride      2·stride               map_size  ↑8      extra_per_entry·len
//! ├─ desc 0 ─┼─ desc 1 ──┼── … ──────────────────┤ (pad) ├─ range 0 ─┼─ range 1 ─┼ …
//! │ 40 bytes + vendor tail                       │       │  caller extra region  │
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod descriptor;
mod error;
mod normalize;
mod ram;
mod service;
mod snapshot;
mod status;

pub use descriptor::{
    DESCRIPTOR_SIZE, DescriptorTable, Descriptors, MemoryAttribute, MemoryDescriptor, MemoryType,
};
pub use error::MemoryMapError;
pub use normalize::{HANDOFF_RANGE_SIZE, HandoffMemoryType, HandoffRange};
pub use ram::{RamLookup, RamMap};
pub use service::{MAX_QUERY_ROUNDS, MapQuery, MemoryMapSource, get_memory_map};
pub use snapshot::{MapBuffer, MapKey, MemoryMapSnapshot};
pub use status::FirmwareStatus;
