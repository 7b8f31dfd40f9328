//! In-memory fixtures for exercising page-table code off the target.
//!
//! Physical addresses are byte offsets into a vector of 4 KiB-aligned frames,
//! so a tree built here can be walked, cloned and installed exactly like a
//! real one behind an identity map.

#![allow(clippy::missing_panics_doc, clippy::cast_possible_truncation)]

use crate::entry::AddressMask;
use crate::relocator::PageTableRoot;
use crate::{AllocationPool, BootAllocator, PhysMapper};
use alloc::vec::Vec;
use boot_addresses::{PAGE_SIZE, PhysicalAddress, align_up};
use boot_mmap::{MemoryAttribute, MemoryDescriptor, MemoryMapSnapshot, MemoryType};
use core::ops::Range;

/// A 4 KiB-aligned raw frame.
#[repr(C, align(4096))]
struct Aligned4K([u8; 4096]);

/// Simulated physical memory.
pub struct TestPhys {
    frames: Vec<Aligned4K>,
    base: *mut u8,
}

impl TestPhys {
    #[must_use]
    pub fn with_frames(n: usize) -> Self {
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            frames.push(Aligned4K([0u8; 4096]));
        }
        // The vector is never resized again, so the pointer stays valid.
        let base = frames.as_mut_ptr().cast::<u8>();
        Self { frames, base }
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        (self.frames.len() * 4096) as u64
    }

    fn slot(&self, table: u64, index: usize) -> *mut u64 {
        assert!(table + 4096 <= self.len_bytes(), "{table:#x} outside test memory");
        assert!(index < 512);
        // SAFETY: bounds checked above; frames are 8-byte aligned.
        unsafe { self.base.add(table as usize).cast::<u64>().add(index) }
    }

    /// Raw entry `index` of the table at physical address `table`.
    #[must_use]
    pub fn entry(&self, table: u64, index: usize) -> u64 {
        // SAFETY: see `slot`.
        unsafe { self.slot(table, index).read() }
    }

    pub fn set_entry(&self, table: u64, index: usize, raw: u64) {
        // SAFETY: see `slot`.
        unsafe { self.slot(table, index).write(raw) }
    }

    #[must_use]
    pub fn nonzero_entries(&self, table: u64) -> usize {
        (0..512).filter(|&i| self.entry(table, i) != 0).count()
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let offset = pa.as_u64();
        assert!(
            offset + size_of::<T>() as u64 <= self.len_bytes(),
            "{pa:?} outside test memory"
        );
        // SAFETY: in bounds; the caller promises `T` matches the bytes.
        unsafe { &mut *self.base.add(offset as usize).cast::<T>() }
    }

    unsafe fn phys_to_bytes_mut<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        let offset = pa.as_u64();
        assert!(offset + len as u64 <= self.len_bytes(), "{pa:?}+{len:#x} outside test memory");
        // SAFETY: in bounds.
        unsafe { core::slice::from_raw_parts_mut(self.base.add(offset as usize), len) }
    }
}

/// Bump allocator over two disjoint physical ranges, one per pool.
pub struct BumpAlloc {
    ordinary: Range<u64>,
    safe: Range<u64>,
    history: Vec<(u64, AllocationPool)>,
}

impl BumpAlloc {
    #[must_use]
    pub const fn new(ordinary: Range<u64>, safe: Range<u64>) -> Self {
        Self {
            ordinary,
            safe,
            history: Vec::new(),
        }
    }

    /// Every successful allocation as `(pages, pool)`.
    #[must_use]
    pub fn history(&self) -> &[(u64, AllocationPool)] {
        &self.history
    }
}

impl BootAllocator for BumpAlloc {
    fn allocate_pages(
        &mut self,
        count: u64,
        align: u64,
        pool: AllocationPool,
    ) -> Option<PhysicalAddress> {
        let range = match pool {
            AllocationPool::Ordinary => &mut self.ordinary,
            AllocationPool::Safe => &mut self.safe,
        };
        let start = align_up(range.start, align.max(PAGE_SIZE));
        let end = start.checked_add(count * PAGE_SIZE)?;
        if end > range.end {
            return None;
        }
        range.start = end;
        self.history.push((count, pool));
        Some(PhysicalAddress::new(start))
    }
}

/// A CR3 stand-in that records every install.
pub struct FakeRoot {
    root: PhysicalAddress,
    mask: AddressMask,
    cache_flags: u64,
    installs: Vec<u64>,
}

impl FakeRoot {
    #[must_use]
    pub const fn new(root: PhysicalAddress) -> Self {
        Self {
            root,
            mask: AddressMask::standard(),
            cache_flags: 0,
            installs: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_mask(mut self, mask: AddressMask) -> Self {
        self.mask = mask;
        self
    }

    #[must_use]
    pub fn with_cache_flags(mut self, flags: u64) -> Self {
        self.cache_flags = flags;
        self
    }

    #[must_use]
    pub fn installs(&self) -> &[u64] {
        &self.installs
    }
}

impl PageTableRoot for FakeRoot {
    fn current_root(&self) -> PhysicalAddress {
        self.root
    }

    unsafe fn install_root(&mut self, root: PhysicalAddress) {
        self.root = root;
        self.installs.push(root.as_u64());
    }

    fn address_mask(&self) -> AddressMask {
        self.mask
    }

    fn table_cache_flags(&self) -> u64 {
        self.cache_flags
    }
}

/// A map with a single conventional region `[0, pages * 4K)`.
#[must_use]
pub fn conventional_map(pages: u64) -> MemoryMapSnapshot {
    let desc = MemoryDescriptor::new(
        MemoryType::CONVENTIONAL,
        PhysicalAddress::zero(),
        pages,
        MemoryAttribute::WRITE_BACK,
    );
    MemoryMapSnapshot::from_descriptors(&[desc], 48, 1, 0).expect("fixture map")
}
