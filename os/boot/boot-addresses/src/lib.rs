//! # Physical and Virtual Boot Addresses
//!
//! Strongly typed wrappers for the raw 64-bit addresses that flow through the
//! firmware handoff: memory-map descriptors, page-table entries, and the
//! runtime-services virtual window.
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`PhysicalAddress`] | Host RAM or MMIO, as reported by firmware and stored in page-table entries. |
//! | [`VirtualAddress`] | An address translated through the page tables. |
//!
//! During the handoff most memory is identity mapped, so the two are frequently
//! compared against each other; [`PhysicalAddress::identity`] makes that
//! comparison explicit instead of silently mixing the types.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use boot_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_0000);
//! let va = pa.identity();
//! assert_eq!(va.as_u64(), pa.as_u64());
//! assert!(pa.is_aligned(PAGE_SIZE));
//! assert_eq!(pages_to_bytes(3), 3 * PAGE_SIZE);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Shift of the 4 KiB base page.
pub const PAGE_SHIFT: u32 = 12;

/// Size of the 4 KiB base page, which is also the firmware's page unit.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Convert a page count into a byte length.
///
/// ```rust
/// # use boot_addresses::pages_to_bytes;
/// assert_eq!(pages_to_bytes(2), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn pages_to_bytes(pages: u64) -> u64 {
    pages << PAGE_SHIFT
}

/// Number of 4 KiB pages needed to hold `bytes`.
///
/// ```rust
/// # use boot_addresses::bytes_to_pages;
/// assert_eq!(bytes_to_pages(1), 1);
/// assert_eq!(bytes_to_pages(0x2000), 2);
/// assert_eq!(bytes_to_pages(0x2001), 3);
/// ```
#[inline]
#[must_use]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Align `x` down to the nearest multiple of `a` (a power of two).
///
/// ```rust
/// # use boot_addresses::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (a power of two).
///
/// ```rust
/// # use boot_addresses::align_up;
/// assert_eq!(align_up(0x1234, 0x1000), 0x2000);
/// assert_eq!(align_up(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}
