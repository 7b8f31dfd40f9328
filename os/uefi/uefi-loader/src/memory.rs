#![allow(unsafe_code)]

use boot_addresses::{PAGE_SIZE, PhysicalAddress, align_up, pages_to_bytes};
use boot_vmem::{AllocationPool, BootAllocator};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicBool, Ordering};
use log::debug;
use uefi::boot;
use uefi::boot::{AllocateType, MemoryType};

/// Pages for the phase-1 page-table copy.
const ORDINARY_POOL_PAGES: usize = 512;

/// Pages that have to outlive the loader: the final page-table copy and the
/// runtime-services virtual map.
const SAFE_POOL_PAGES: usize = 512;

static BOOT_SERVICES_ACTIVE: AtomicBool = AtomicBool::new(true);

/// Mark the pool allocator as dead. Called right after `ExitBootServices`.
pub fn boot_services_exited() {
    BOOT_SERVICES_ACTIVE.store(false, Ordering::SeqCst);
}

/// The heap, served from `AllocatePool` while boot services last.
///
/// Pool memory is only 8-byte aligned. Each block is padded for the requested
/// alignment, and the pool pointer is kept in the word right below the
/// address handed out. After exit, allocations fail and frees are leaked.
pub struct UefiBootAllocator;

#[global_allocator]
static GLOBAL_ALLOC: UefiBootAllocator = UefiBootAllocator;

/// Room for the pool pointer in front of every block.
const BLOCK_HEADER: usize = size_of::<usize>();

/// Alignment and pool bytes needed for `layout`.
fn block_size(layout: Layout) -> Option<(usize, usize)> {
    let align = layout.align().max(BLOCK_HEADER);
    let total = layout
        .size()
        .max(1)
        .checked_add(align)?
        .checked_add(BLOCK_HEADER)?;
    Some((align, total))
}

unsafe impl GlobalAlloc for UefiBootAllocator {
    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !BOOT_SERVICES_ACTIVE.load(Ordering::SeqCst) {
            return null_mut();
        }
        let Some((align, total)) = block_size(layout) else {
            return null_mut();
        };
        let Ok(block) = boot::allocate_pool(MemoryType::LOADER_DATA, total) else {
            return null_mut();
        };

        let start = block.as_ptr();
        let skip = (start as usize + BLOCK_HEADER).next_multiple_of(align) - start as usize;
        // SAFETY: `skip + layout.size() <= total`, and the header word sits
        // between `start` and the aligned address.
        unsafe {
            let user = start.add(skip);
            user.sub(BLOCK_HEADER).cast::<*mut u8>().write(start);
            user
        }
    }

    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if !BOOT_SERVICES_ACTIVE.load(Ordering::SeqCst) {
            return;
        }
        // SAFETY: `alloc` stored the pool pointer right below `ptr`.
        let start = unsafe { ptr.sub(BLOCK_HEADER).cast::<*mut u8>().read() };
        if let Some(start) = NonNull::new(start) {
            // SAFETY: `start` came from `allocate_pool` and is freed once.
            let _ = unsafe { boot::free_pool(start) };
        }
    }
}

/// A run of `LOADER_DATA` pages handed out front to back.
struct PagePool {
    next: u64,
    end: u64,
}

impl PagePool {
    fn reserve(pages: usize) -> uefi::Result<Self> {
        let base = boot::allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, pages)?;
        let next = base.as_ptr() as u64;
        Ok(Self {
            next,
            end: next + pages_to_bytes(pages as u64),
        })
    }

    fn take(&mut self, count: u64, align: u64) -> Option<PhysicalAddress> {
        let start = align_up(self.next, align.max(PAGE_SIZE));
        let end = start.checked_add(pages_to_bytes(count))?;
        if end > self.end {
            return None;
        }
        self.next = end;
        Some(PhysicalAddress::new(start))
    }

    const fn remaining_pages(&self) -> u64 {
        (self.end - self.next) / PAGE_SIZE
    }
}

/// Page allocator that keeps working after boot services exit.
///
/// Both pools are reserved from the firmware up front; nothing is returned.
pub struct LoaderAllocator {
    ordinary: PagePool,
    safe: PagePool,
}

impl LoaderAllocator {
    /// Reserve both pools. Must run while boot services are active.
    pub fn reserve() -> uefi::Result<Self> {
        let ordinary = PagePool::reserve(ORDINARY_POOL_PAGES)?;
        let safe = PagePool::reserve(SAFE_POOL_PAGES)?;
        debug!(
            "reserved allocator pools: ordinary {:#x}, safe {:#x}",
            ordinary.next, safe.next
        );
        Ok(Self { ordinary, safe })
    }
}

impl BootAllocator for LoaderAllocator {
    fn allocate_pages(
        &mut self,
        count: u64,
        align: u64,
        pool: AllocationPool,
    ) -> Option<PhysicalAddress> {
        let source = match pool {
            AllocationPool::Ordinary => &mut self.ordinary,
            AllocationPool::Safe => &mut self.safe,
        };
        let pa = source.take(count, align);
        if pa.is_none() {
            debug!(
                "{pool:?} pool cannot serve {count} pages ({} left)",
                source.remaining_pages()
            );
        }
        pa
    }
}
