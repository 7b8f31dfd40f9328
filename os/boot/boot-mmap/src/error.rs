use crate::FirmwareStatus;

#[derive(Debug, thiserror::Error)]
pub enum MemoryMapError {
    #[error("firmware rejected the memory map query: {0}")]
    Firmware(FirmwareStatus),
    #[error("firmware reported success for a zero-sized memory map buffer")]
    UnexpectedSizingSuccess,
    #[error("descriptor stride {stride} is smaller than a descriptor ({minimum} bytes)")]
    InvalidStride { stride: usize, minimum: usize },
    #[error("failed to allocate {requested} bytes for the memory map")]
    OutOfMemory { requested: usize },
    #[error("memory map buffer size overflowed")]
    SizeOverflow,
    #[error("extra region holds {available} bytes but {required} are needed")]
    ExtraRegionTooSmall { available: usize, required: usize },
    #[error("memory map kept growing after {0} query rounds")]
    TooManyRounds(usize),
}
