#[derive(Debug, thiserror::Error)]
pub enum RtsError {
    #[error("failed to allocate {bytes} bytes for the virtual memory map")]
    OutOfResources { bytes: usize },
}
