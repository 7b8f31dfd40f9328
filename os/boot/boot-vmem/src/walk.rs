//! Walking and extending a live tree.
//!
//! The runtime-services switch needs a few targeted operations on the active
//! tree: look up how a page is currently mapped, add 4 KiB mappings at new
//! virtual addresses, and edit top-level entries directly.

use crate::entry::{AddressMask, Level, PageEntryBits, small_leaf_flags};
use crate::error::WalkError;
use crate::node::PageTableNode;
use crate::{AllocationPool, BootAllocator, PhysMapper};
use boot_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use log::trace;

/// A present leaf and the level it was found at.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LeafMapping {
    pub entry: u64,
    pub level: Level,
}

impl LeafMapping {
    #[must_use]
    pub const fn bits(self) -> PageEntryBits {
        PageEntryBits::from_bits(self.entry)
    }

    /// Attribute bits in 4 KiB leaf format.
    #[must_use]
    pub const fn small_flags(self) -> u64 {
        small_leaf_flags(self.entry, self.level)
    }
}

pub struct PageWalker<'m, M: PhysMapper> {
    mapper: &'m M,
    root: PhysicalAddress,
    mask: AddressMask,
}

impl<'m, M: PhysMapper> PageWalker<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M, root: PhysicalAddress, mask: AddressMask) -> Self {
        Self { mapper, root, mask }
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Run `f` on the level-4 table.
    pub fn with_root<T>(&self, f: impl FnOnce(&mut PageTableNode) -> T) -> T {
        // SAFETY: the root is a mapped table page for the walker's lifetime.
        f(unsafe { self.node(self.root) })
    }

    /// The leaf currently mapping `va`.
    ///
    /// # Errors
    /// [`WalkError::NotMapped`] if any entry on the way is not present.
    pub fn leaf(&self, va: VirtualAddress) -> Result<LeafMapping, WalkError> {
        let mut table = self.root;
        let mut level = Level::ROOT;
        loop {
            // SAFETY: `table` is the root or was read from a present table entry.
            let node = unsafe { self.node(table) };
            let raw = node.get(level.index_of(va));
            if !PageEntryBits::from_bits(raw).present() {
                return Err(WalkError::NotMapped(va));
            }
            if level.maps_leaf(raw) {
                return Ok(LeafMapping { entry: raw, level });
            }
            let Some(next) = level.down() else {
                return Err(WalkError::NotMapped(va));
            };
            table = self.mask.table_address(raw);
            level = next;
        }
    }

    /// The level-1 table covering `va`, creating missing tables on the way.
    ///
    /// New tables come from the safe pool and are linked with `table_flags`.
    ///
    /// # Errors
    /// [`WalkError::LargePageInPath`] if a 2 MiB / 1 GiB leaf already covers
    /// `va`, [`WalkError::OutOfMemory`] if a table cannot be allocated.
    pub fn ensure_l1_table<A>(
        &self,
        va: VirtualAddress,
        alloc: &mut A,
        table_flags: u64,
    ) -> Result<PhysicalAddress, WalkError>
    where
        A: BootAllocator + ?Sized,
    {
        let mut table = self.root;
        let mut level = Level::ROOT;
        while let Some(next) = level.down() {
            // SAFETY: as in `leaf`; freshly allocated tables are zeroed below.
            let node = unsafe { self.node(table) };
            let index = level.index_of(va);
            let raw = node.get(index);

            table = if !PageEntryBits::from_bits(raw).present() {
                let fresh = alloc
                    .allocate_pages(1, PAGE_SIZE, AllocationPool::Safe)
                    .ok_or(WalkError::OutOfMemory)?;
                // SAFETY: a fresh page from the allocator, mapped by the identity map.
                unsafe { self.node(fresh) }.zero();
                node.set(index, fresh.as_u64() | table_flags);
                trace!("new L{} table at {fresh:?} for {va:?}", next.get());
                fresh
            } else if level.maps_leaf(raw) {
                return Err(WalkError::LargePageInPath {
                    va,
                    level: level.get(),
                });
            } else {
                self.mask.table_address(raw)
            };
            level = next;
        }
        Ok(table)
    }

    /// Map the 4 KiB page at `va` to `pa` with leaf attribute bits `flags`.
    ///
    /// # Errors
    /// See [`ensure_l1_table`](Self::ensure_l1_table).
    pub fn map_page<A>(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: u64,
        alloc: &mut A,
        table_flags: u64,
    ) -> Result<(), WalkError>
    where
        A: BootAllocator + ?Sized,
    {
        let l1 = self.ensure_l1_table(va, alloc, table_flags)?;
        // SAFETY: `l1` was returned by the walk above.
        let node = unsafe { self.node(l1) };
        node.set(Level::PAGE_TABLE.index_of(va), pa.as_u64() | flags);
        Ok(())
    }

    unsafe fn node(&self, pa: PhysicalAddress) -> &'m mut PageTableNode {
        unsafe { self.mapper.phys_to_mut::<PageTableNode>(pa) }
    }
}
