//! # Typed `X86_64` Registers for the Boot Handoff
//!
//! The handoff only touches two pieces of CPU state: CR3, to read and replace
//! the active page-table root, and CPUID, to discover whether the memory
//! encryption bit has to be stripped from page-table addresses.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cpuid;
pub mod cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Storing CR3 replaces the active address space; everything the caller
    /// touches afterwards must be mapped by the new tables.
    unsafe fn store_unsafe(self);
}
