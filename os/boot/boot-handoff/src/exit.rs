//! Leaving boot services.
//!
//! `ExitBootServices` only succeeds with the key of the latest memory map,
//! and any allocation in between (including the snapshot buffer itself)
//! invalidates it. The loop here snapshots and terminates back-to-back and
//! starts over whenever the firmware reports a stale key.

use crate::error::HandoffError;
use boot_mmap::{FirmwareStatus, MapKey, MemoryMapSnapshot, MemoryMapSource, get_memory_map};
use boot_rts::RuntimeServices;
use log::{debug, info};

/// Upper bound on `ExitBootServices` attempts.
pub const MAX_EXIT_ATTEMPTS: usize = 16;

/// Boot services, held by value until they are terminated.
pub trait BootServices: MemoryMapSource + Sized {
    type Runtime: FirmwareRuntime;

    /// Stop network controllers that would otherwise keep doing DMA into
    /// memory the kernel is about to reuse.
    fn disable_network_controllers(&mut self);

    /// `ExitBootServices(key)`.
    ///
    /// # Errors
    /// The firmware status, together with the still-usable boot services.
    fn terminate(self, key: MapKey) -> Result<Self::Runtime, (Self, FirmwareStatus)>;
}

/// What is left of the firmware after boot services are gone.
pub trait FirmwareRuntime: RuntimeServices {
    /// Null the console and boot-services pointers in the system table and
    /// refresh its header checksum.
    fn neutralize_handles(&mut self);
}

/// Take the final memory map and exit boot services with its key.
///
/// Snapshots whose key went stale are dropped before the next attempt.
/// Nothing is logged between the final map query and `ExitBootServices`.
///
/// # Errors
/// * [`HandoffError::MemoryMap`] if a snapshot cannot be taken.
/// * [`HandoffError::ExitHandshake`] for any status other than a stale key.
/// * [`HandoffError::ExitRetriesExhausted`] after [`MAX_EXIT_ATTEMPTS`] stale keys.
pub fn exit_boot_services<B: BootServices>(
    mut boot: B,
    extra_bytes_per_entry: usize,
) -> Result<(MemoryMapSnapshot, B::Runtime), HandoffError> {
    for attempt in 1..=MAX_EXIT_ATTEMPTS {
        let snapshot = get_memory_map(&mut boot, extra_bytes_per_entry)?;
        let key = snapshot.key();
        match boot.terminate(key) {
            Ok(mut runtime) => {
                runtime.neutralize_handles();
                info!("exited boot services on attempt {attempt} with key {key:?}");
                debug!(
                    "memory map: {} descriptors, stride {}, version {}",
                    snapshot.len(),
                    snapshot.stride(),
                    snapshot.version()
                );
                return Ok((snapshot, runtime));
            }
            Err((returned, FirmwareStatus::InvalidParameter)) => {
                debug!("map key {key:?} went stale, attempt {attempt}");
                drop(snapshot);
                boot = returned;
            }
            Err((_, status)) => return Err(HandoffError::ExitHandshake(status)),
        }
    }
    Err(HandoffError::ExitRetriesExhausted(MAX_EXIT_ATTEMPTS))
}
