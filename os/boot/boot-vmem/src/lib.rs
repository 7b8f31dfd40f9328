//! # Page-Table Relocation for the Boot Handoff
//!
//! The firmware's page tables are the only thing keeping the loader alive
//! after `ExitBootServices`, yet they sit in memory the kernel will reclaim.
//! This crate copies them somewhere safe without understanding more of the
//! tree than it has to.
//!
//! ## What you get
//! - [`PageTableCloner`]: a single recursive traversal that either measures or
//!   writes a compacted, identity-only copy of a tree ([`CloneTarget`]).
//! - [`TwoPhaseRelocator`]: the measure → reserve → write → install sequence,
//!   once into ordinary memory and once into the safe pool.
//! - [`PageWalker`]: lookups and 4 KiB mappings on the live tree, used when
//!   runtime services get their new virtual addresses.
//! - [`AddressMask`]: physical-address extraction that honors the SEV C-bit.
//!
//! ## x86-64 walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L4   |  L3   |  L2   |  L1   | Offset |
//!
//!  L4  →  L3  →  L2  →  L1  →  4 KiB page
//!          │      └─ PS=1 → 2 MiB page
//!          └─ PS=1 → 1 GiB page
//! ```
//!
//! The cloner runs while the tree is live, so every table is reached through
//! a [`PhysMapper`]; in the loader that is the firmware's identity map.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

mod cloner;
mod entry;
mod error;
mod node;
mod relocator;
mod walk;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use boot_addresses::PhysicalAddress;

pub use crate::cloner::{CloneTarget, NodeCount, PageTableCloner, RelocationPlan};
pub use crate::entry::{
    ATTRIBUTE_BITS, AddressMask, ENTRIES_PER_TABLE, InheritedAttributes, LARGE_PAT, Level,
    PageEntryBits, small_leaf_flags,
};
pub use crate::error::{RelocationError, WalkError};
pub use crate::node::PageTableNode;
pub use crate::relocator::{PageTableRoot, Phase1Reservation, RelocatedRoot, TwoPhaseRelocator};
pub use crate::walk::{LeafMapping, PageWalker};

/// Where [`BootAllocator`] takes pages from.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AllocationPool {
    /// Any free memory.
    Ordinary,
    /// Memory guaranteed not to overlap anything loaded later (kernel, modules).
    Safe,
}

/// Physical page allocator provided by the loader.
///
/// Implementations must keep working after boot services have exited, e.g.
/// by serving from pools reserved beforehand.
pub trait BootAllocator {
    /// Allocate `count` contiguous 4 KiB pages aligned to `align` bytes.
    ///
    /// Returns `None` on exhaustion.
    fn allocate_pages(
        &mut self,
        count: u64,
        align: u64,
        pool: AllocationPool,
    ) -> Option<PhysicalAddress>;
}

/// Converts physical addresses to usable references in the current address
/// space (identity-mapped in the loader).
///
/// # Safety
/// - `pa` must be mapped writable for `&mut T`.
/// - The mapping must stay valid for `'a`.
/// - `T` must match the bytes at `pa`.
pub trait PhysMapper {
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// `len` bytes starting at `pa`.
    ///
    /// # Safety
    /// See the trait documentation; the whole range must be mapped.
    unsafe fn phys_to_bytes_mut<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        let first: *mut u8 = unsafe { self.phys_to_mut::<u8>(pa) };
        unsafe { core::slice::from_raw_parts_mut(first, len) }
    }
}
