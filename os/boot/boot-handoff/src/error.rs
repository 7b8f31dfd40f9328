use boot_mmap::{FirmwareStatus, MemoryMapError};
use boot_rts::RtsError;
use boot_vmem::RelocationError;

/// Anything that stops the handoff. Degraded runtime-services outcomes are
/// not errors; see [`RtsState`](boot_rts::RtsState).
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error(transparent)]
    MemoryMap(#[from] MemoryMapError),
    #[error(transparent)]
    Relocation(#[from] RelocationError),
    #[error(transparent)]
    Rts(#[from] RtsError),
    #[error("ExitBootServices failed: {0}")]
    ExitHandshake(FirmwareStatus),
    #[error("memory map key still stale after {0} ExitBootServices attempts")]
    ExitRetriesExhausted(usize),
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("option `{option}` has an invalid value")]
    InvalidValue { option: &'static str },
}
