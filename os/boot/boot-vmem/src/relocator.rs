//! # Two-Phase Page-Table Relocation
//!
//! The firmware's page tables live in boot-services memory, which the kernel
//! is free to reuse. Before handing over, the loader moves the active tree
//! twice:
//!
//! 1. **Phase 1**, into ordinary memory. [`TwoPhaseRelocator::prepare`] measures
//!    and reserves while boot services can still allocate;
//!    [`TwoPhaseRelocator::commit`] writes the copy and switches to it once
//!    boot services are gone.
//! 2. **Phase 2**, into memory from the safe pool, which nothing loaded later
//!    overlaps. [`TwoPhaseRelocator::relocate_final`] runs after the runtime
//!    services switch and before control passes to the kernel.

use crate::cloner::{CloneTarget, NodeCount, PageTableCloner, RelocationPlan};
use crate::entry::AddressMask;
use crate::error::RelocationError;
use crate::{AllocationPool, BootAllocator, PhysMapper};
use boot_addresses::{PAGE_SIZE, PhysicalAddress};
use boot_mmap::RamMap;
use log::{debug, info};

/// Owner of the active page-table root (CR3 on x86-64).
pub trait PageTableRoot {
    fn current_root(&self) -> PhysicalAddress;

    /// Switch the CPU to the tree at `root`.
    ///
    /// # Safety
    /// `root` must be a complete level-4 table that maps the currently
    /// executing code, its stack and every table it points to.
    unsafe fn install_root(&mut self, root: PhysicalAddress);

    fn address_mask(&self) -> AddressMask;

    /// Caching bits (PWT/PCD) the root is installed with, for new table entries.
    fn table_cache_flags(&self) -> u64 {
        0
    }
}

/// Pages reserved by [`TwoPhaseRelocator::prepare`].
#[must_use = "the reservation has to be committed after exiting boot services"]
#[derive(Debug, Eq, PartialEq)]
pub struct Phase1Reservation {
    base: PhysicalAddress,
    pages: NodeCount,
}

impl Phase1Reservation {
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub const fn pages(&self) -> NodeCount {
        self.pages
    }
}

/// A tree that is now the active root.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RelocatedRoot {
    pub root: PhysicalAddress,
    pub pages: NodeCount,
}

pub struct TwoPhaseRelocator<'m, M: PhysMapper> {
    mapper: &'m M,
}

impl<'m, M: PhysMapper> TwoPhaseRelocator<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self { mapper }
    }

    /// Measure the live tree and reserve ordinary memory for its copy.
    ///
    /// # Errors
    /// [`RelocationError::EmptyTree`] if nothing would survive the copy, or
    /// [`RelocationError::OutOfMemory`] if the reservation fails.
    pub fn prepare<R, A>(
        &self,
        root: &R,
        ram: RamMap<'_>,
        alloc: &mut A,
    ) -> Result<Phase1Reservation, RelocationError>
    where
        R: PageTableRoot + ?Sized,
        A: BootAllocator + ?Sized,
    {
        let pages = self.measure(root, ram)?;
        let base = allocate(alloc, pages, AllocationPool::Ordinary)?;
        debug!("phase 1: reserved {} table pages at {base:?}", pages.0);
        Ok(Phase1Reservation { base, pages })
    }

    /// Write the copy into the phase-1 reservation and switch to it.
    ///
    /// # Errors
    /// [`RelocationError::TreeGrew`] if the tree no longer fits the reservation.
    pub fn commit<R>(
        &self,
        reservation: Phase1Reservation,
        root: &mut R,
        ram: RamMap<'_>,
    ) -> Result<RelocatedRoot, RelocationError>
    where
        R: PageTableRoot + ?Sized,
    {
        let measured = self.measure(root, ram)?;
        if measured > reservation.pages {
            return Err(RelocationError::TreeGrew {
                reserved: reservation.pages.0,
                measured: measured.0,
            });
        }

        let relocated = self.write_and_install(root, ram, reservation.base, reservation.pages)?;
        info!("phase 1: page tables moved to {:?}", relocated.root);
        Ok(relocated)
    }

    /// Copy the active tree into safe memory and switch to it.
    ///
    /// # Errors
    /// [`RelocationError::OutOfMemory`] if the safe pool is exhausted.
    pub fn relocate_final<R, A>(
        &self,
        root: &mut R,
        ram: RamMap<'_>,
        alloc: &mut A,
    ) -> Result<RelocatedRoot, RelocationError>
    where
        R: PageTableRoot + ?Sized,
        A: BootAllocator + ?Sized,
    {
        let pages = self.measure(root, ram)?;
        let base = allocate(alloc, pages, AllocationPool::Safe)?;
        let relocated = self.write_and_install(root, ram, base, pages)?;
        info!("phase 2: page tables moved to {:?}", relocated.root);
        Ok(relocated)
    }

    fn measure<R>(&self, root: &R, ram: RamMap<'_>) -> Result<NodeCount, RelocationError>
    where
        R: PageTableRoot + ?Sized,
    {
        let plan = RelocationPlan::for_root(root.current_root(), root.address_mask());
        let pages = PageTableCloner::new(self.mapper, ram).measure(plan);
        if pages.is_empty() {
            return Err(RelocationError::EmptyTree);
        }
        debug!("page-table tree at {:?}: {} pages", plan.source_root, pages.0);
        Ok(pages)
    }

    fn write_and_install<R>(
        &self,
        root: &mut R,
        ram: RamMap<'_>,
        base: PhysicalAddress,
        pages: NodeCount,
    ) -> Result<RelocatedRoot, RelocationError>
    where
        R: PageTableRoot + ?Sized,
    {
        let plan = RelocationPlan::for_root(root.current_root(), root.address_mask());
        let target = CloneTarget::Write {
            base,
            limit: base + pages.bytes(),
        };
        let written = PageTableCloner::new(self.mapper, ram).clone_tree(plan, target);
        if written.is_empty() {
            return Err(RelocationError::CopyIncomplete { reserved: pages.0 });
        }

        // SAFETY: the copy identity-maps all RAM the old tree identity-mapped,
        // which includes this code, its stack and the new tables themselves.
        unsafe { root.install_root(base) };
        Ok(RelocatedRoot {
            root: base,
            pages: written,
        })
    }
}

fn allocate<A>(
    alloc: &mut A,
    pages: NodeCount,
    pool: AllocationPool,
) -> Result<PhysicalAddress, RelocationError>
where
    A: BootAllocator + ?Sized,
{
    alloc
        .allocate_pages(pages.0, PAGE_SIZE, pool)
        .ok_or(RelocationError::OutOfMemory {
            pages: pages.0,
            pool,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpAlloc, FakeRoot, TestPhys, conventional_map};

    const P: u64 = 1 << 0;
    const W: u64 = 1 << 1;

    /// Root at 0x1000 identity-mapping 0x8000 through a 4 KiB leaf.
    fn minimal_tree(phys: &TestPhys) -> FakeRoot {
        phys.set_entry(0x1000, 0, 0x2000 | P | W);
        phys.set_entry(0x2000, 0, 0x3000 | P | W);
        phys.set_entry(0x3000, 0, 0x4000 | P | W);
        phys.set_entry(0x4000, 8, 0x8000 | P | W);
        FakeRoot::new(PhysicalAddress::new(0x1000))
    }

    #[test]
    fn phases_move_the_root_into_ordinary_then_safe_memory() {
        let phys = TestPhys::with_frames(64);
        let mut root = minimal_tree(&phys);
        let map = conventional_map(64);
        let mut alloc = BumpAlloc::new(0x10000..0x20000, 0x20000..0x40000);
        let relocator = TwoPhaseRelocator::new(&phys);

        let reservation = relocator.prepare(&root, RamMap::new(&map), &mut alloc).unwrap();
        assert_eq!(reservation.pages(), NodeCount(4));
        assert_eq!(reservation.base().as_u64(), 0x10000);
        assert!(root.installs().is_empty());

        let phase1 = relocator.commit(reservation, &mut root, RamMap::new(&map)).unwrap();
        assert_eq!(phase1.root.as_u64(), 0x10000);
        assert_eq!(root.current_root().as_u64(), 0x10000);

        let phase2 = relocator
            .relocate_final(&mut root, RamMap::new(&map), &mut alloc)
            .unwrap();
        assert_eq!(phase2.root.as_u64(), 0x20000);
        assert_eq!(phase2.pages, NodeCount(4));
        assert_eq!(root.installs(), [0x10000, 0x20000]);
        assert_eq!(
            alloc.history(),
            [(4, AllocationPool::Ordinary), (4, AllocationPool::Safe)]
        );

        // The final copy was made from the phase-1 copy and still maps 0x8000.
        assert_eq!(phys.entry(0x23000, 8), 0x8000 | P | W);
    }

    #[test]
    fn growth_after_measuring_is_fatal() {
        let phys = TestPhys::with_frames(64);
        let mut root = minimal_tree(&phys);
        let map = conventional_map(64);
        let mut alloc = BumpAlloc::new(0x10000..0x20000, 0x20000..0x40000);
        let relocator = TwoPhaseRelocator::new(&phys);

        let reservation = relocator.prepare(&root, RamMap::new(&map), &mut alloc).unwrap();
        // Firmware adds another identity-mapped table after the reservation.
        phys.set_entry(0x3000, 1, 0x5000 | P | W);
        phys.set_entry(0x5000, 0, 0x20_0000 | P);
        let map = conventional_map(0x400);

        let err = relocator
            .commit(reservation, &mut root, RamMap::new(&map))
            .unwrap_err();
        assert!(matches!(err, RelocationError::TreeGrew { reserved: 4, measured: 5 }));
        assert!(root.installs().is_empty());
    }

    #[test]
    fn safe_pool_exhaustion_is_fatal() {
        let phys = TestPhys::with_frames(64);
        let mut root = minimal_tree(&phys);
        let map = conventional_map(64);
        let mut alloc = BumpAlloc::new(0x10000..0x20000, 0x20000..0x22000);
        let relocator = TwoPhaseRelocator::new(&phys);

        let err = relocator
            .relocate_final(&mut root, RamMap::new(&map), &mut alloc)
            .unwrap_err();
        assert!(matches!(
            err,
            RelocationError::OutOfMemory { pages: 4, pool: AllocationPool::Safe }
        ));
    }

    #[test]
    fn nothing_to_keep_is_an_error() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(0x4000..0x8000, 0x4000..0x8000);
        let root = FakeRoot::new(PhysicalAddress::new(0x1000));
        let map = conventional_map(8);
        let err = TwoPhaseRelocator::new(&phys)
            .prepare(&root, RamMap::new(&map), &mut alloc)
            .unwrap_err();
        assert!(matches!(err, RelocationError::EmptyTree));
    }
}
