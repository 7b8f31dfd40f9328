use crate::AllocationPool;
use boot_addresses::VirtualAddress;

#[derive(Debug, thiserror::Error)]
pub enum RelocationError {
    #[error("the active page-table tree has no identity mappings to keep")]
    EmptyTree,
    #[error("failed to allocate {pages} page-table pages from the {pool:?} pool")]
    OutOfMemory { pages: u64, pool: AllocationPool },
    #[error("page-table tree grew from {reserved} to {measured} pages after measuring")]
    TreeGrew { reserved: u64, measured: u64 },
    #[error("page-table copy did not fit its {reserved} reserved pages")]
    CopyIncomplete { reserved: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("{0:?} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{va:?} is covered by a large page at level {level}")]
    LargePageInPath { va: VirtualAddress, level: u8 },
    #[error("no memory left for a page-table page")]
    OutOfMemory,
}
