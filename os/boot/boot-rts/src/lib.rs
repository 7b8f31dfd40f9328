//! # Runtime-Services Relocation
//!
//! UEFI runtime services keep running after the loader is gone, inside the
//! kernel's address space. `SetVirtualAddressMap` tells the firmware where
//! its regions will live; this crate picks that layout and performs the
//! switch.
//!
//! - [`RtsPolicy`]: the closed set of layouts, tried in [`RtsPolicy::ORDER`].
//! - [`RtsEngine`]: `select` then `apply`, each consuming the engine.
//! - [`can_old_and_new`]: whether identity and window mappings can be live
//!   at the same time, for firmware that needs both during the switch.
//!
//! The window must start on a 512 GiB boundary so that it owns whole
//! top-level page-table entries.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod engine;
mod error;
mod policy;
mod quirks;
mod window;

pub use crate::engine::{
    DisableReason, RtsConfig, RtsContext, RtsEngine, RtsState, RuntimeServices,
};
pub use crate::error::RtsError;
pub use crate::policy::RtsPolicy;
pub use crate::quirks::can_old_and_new;
pub use crate::window::{Capabilities, ROOT_SLOT_SPAN, RtsWindow};
