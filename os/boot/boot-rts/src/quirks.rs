//! Page-table edits that keep firmware alive across `SetVirtualAddressMap`.
//!
//! Some firmware keeps using physical pointers while it converts itself to
//! the new layout. For those, the old (identity) and new (window) mappings
//! must both be live during the call and the new ones are torn down after.

use crate::engine::RtsContext;
use crate::window::RtsWindow;
use boot_addresses::pages_to_bytes;
use boot_mmap::{DescriptorTable, MemoryDescriptor, MemoryMapSnapshot};
use boot_vmem::{BootAllocator, ENTRIES_PER_TABLE, Level, PageWalker, PhysMapper};
use log::{debug, warn};

/// Whether identity and window mappings can coexist.
///
/// They cannot if a runtime region physically overlaps the window or if the
/// root table is mapped read-only. On success, stale top-level entries inside
/// the window are cleared so the window starts out empty.
#[must_use]
pub fn can_old_and_new<M: PhysMapper>(
    map: &MemoryMapSnapshot,
    window: RtsWindow,
    walker: &PageWalker<'_, M>,
) -> bool {
    let overlapping = map
        .iter()
        .filter(MemoryDescriptor::is_runtime)
        .find(|d| window.overlaps(d.physical_start.as_u64(), d.physical_end().as_u64()));
    if let Some(desc) = overlapping {
        debug!("old-and-new: {desc:?} overlaps the runtime window");
        return false;
    }

    match walker.leaf(walker.root().identity()) {
        Ok(leaf) if leaf.bits().writable() => {}
        Ok(_) => {
            debug!("old-and-new: root table {:?} is mapped read-only", walker.root());
            return false;
        }
        Err(e) => {
            debug!("old-and-new: root table lookup failed: {e}");
            return false;
        }
    }

    walker.with_root(|l4| {
        for slot in window.root_slots() {
            if l4.bits(slot).present() {
                debug!("clearing stale L4 slot {slot} inside the runtime window");
                l4.clear(slot);
            }
        }
    });
    true
}

/// Copy the low top-level entries into the window slots, so that
/// `window + PA` reaches the same page as `PA`.
///
/// Slots are copied in ascending order. For a window below slot 256 the
/// source and destination ranges overlap, so later slots receive entries
/// that were already mirrored: every slot from `first` up repeats the
/// pattern of `L4[0..first]`.
pub(crate) fn mirror_identity_slots<M: PhysMapper>(walker: &PageWalker<'_, M>, window: RtsWindow) {
    let first = window.first_slot();
    walker.with_root(|l4| {
        for i in 0..ENTRIES_PER_TABLE - first {
            l4.set(first + i, l4.get(i));
        }
    });
    debug!("mirrored identity slots into L4[{first}..]");
}

/// Undo [`mirror_identity_slots`] for slots nobody changed since.
pub(crate) fn clear_mirrored_slots<M: PhysMapper>(walker: &PageWalker<'_, M>, window: RtsWindow) {
    let first = window.first_slot();
    walker.with_root(|l4| {
        for i in 0..ENTRIES_PER_TABLE - first {
            let mirrored = l4.get(first + i);
            if l4.bits(first + i).present() && mirrored == l4.get(i) {
                l4.clear(first + i);
            }
        }
    });
}

/// Map every page of every virtual-map entry at its new virtual address,
/// reusing the attributes of the current mapping of its physical page.
///
/// Failures are logged and leave the remaining regions unmapped; the switch
/// itself still goes ahead.
pub(crate) fn map_virtual_ranges<M, A>(ctx: &mut RtsContext<'_, M, A>, vmap: &DescriptorTable<'_>)
where
    M: PhysMapper,
    A: BootAllocator + ?Sized,
{
    for desc in vmap.iter() {
        let flags = match ctx.walker.leaf(desc.physical_start.identity()) {
            Ok(leaf) => leaf.small_flags(),
            Err(e) => {
                warn!("cannot map runtime region {desc:?}: {e}");
                return;
            }
        };
        for page in 0..desc.page_count {
            let offset = pages_to_bytes(page);
            let mapped = ctx.walker.map_page(
                desc.virtual_start + offset,
                desc.physical_start + offset,
                flags,
                &mut *ctx.alloc,
                ctx.table_flags,
            );
            if let Err(e) = mapped {
                warn!("cannot map runtime page {:?}: {e}", desc.virtual_start + offset);
                return;
            }
        }
    }
}

/// Drop the top-level entries covering every virtual-map entry.
pub(crate) fn unmap_virtual_ranges<M: PhysMapper>(
    walker: &PageWalker<'_, M>,
    vmap: &DescriptorTable<'_>,
) {
    walker.with_root(|l4| {
        for desc in vmap.iter().filter(|d| d.page_count > 0) {
            let first = Level::ROOT.index_of(desc.virtual_start);
            let last = Level::ROOT.index_of(desc.virtual_start + (desc.size() - 1));
            for slot in first..=last.max(first) {
                if l4.bits(slot).present() {
                    l4.clear(slot);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use boot_addresses::{PhysicalAddress, VirtualAddress};
    use boot_mmap::{MemoryAttribute, MemoryType};
    use boot_vmem::testing::{BumpAlloc, FakeRoot, TestPhys};
    use boot_vmem::{AddressMask, AllocationPool};

    const P: u64 = 1 << 0;
    const W: u64 = 1 << 1;
    const A: u64 = 1 << 5;
    const XD: u64 = 1 << 63;
    const ROOT: u64 = 0x1000;
    const WINDOW_BASE: u64 = 0xffff_ff00_0000_0000;

    /// Root at 0x1000, identity-mapping itself and the page at 0x5000.
    fn live_tree(root_flags: u64) -> TestPhys {
        let phys = TestPhys::with_frames(32);
        phys.set_entry(ROOT, 0, 0x2000 | P | W);
        phys.set_entry(0x2000, 0, 0x3000 | P | W);
        phys.set_entry(0x3000, 0, 0x4000 | P | W);
        phys.set_entry(0x4000, 1, ROOT | root_flags);
        phys.set_entry(0x4000, 5, 0x5000 | P | XD);
        phys
    }

    fn walker(phys: &TestPhys) -> PageWalker<'_, TestPhys> {
        PageWalker::new(phys, PhysicalAddress::new(ROOT), AddressMask::standard())
    }

    fn window() -> RtsWindow {
        RtsWindow::new(VirtualAddress::new(WINDOW_BASE), 64 << 30)
    }

    fn runtime_map(pa: u64) -> MemoryMapSnapshot {
        let desc = MemoryDescriptor::new(
            MemoryType::RUNTIME_SERVICES_DATA,
            PhysicalAddress::new(pa),
            1,
            MemoryAttribute::RUNTIME,
        );
        MemoryMapSnapshot::from_descriptors(&[desc], 48, 1, 0).unwrap()
    }

    #[test]
    fn mirror_then_clear_restores_the_root() {
        let phys = live_tree(P | W);
        phys.set_entry(ROOT, 1, 0x6000 | P | W);
        let walker = walker(&phys);

        mirror_identity_slots(&walker, window());
        assert_eq!(phys.entry(ROOT, 510), phys.entry(ROOT, 0));
        assert_eq!(phys.entry(ROOT, 511), phys.entry(ROOT, 1));
        assert_eq!(
            walker.leaf(VirtualAddress::new(WINDOW_BASE + 0x5000)).unwrap().entry,
            0x5000 | P | XD
        );

        // A slot the firmware rewrote in the meantime survives the cleanup.
        phys.set_entry(ROOT, 511, 0x7000 | P | W);
        clear_mirrored_slots(&walker, window());
        assert_eq!(phys.entry(ROOT, 510), 0);
        assert_eq!(phys.entry(ROOT, 511), 0x7000 | P | W);
        assert_eq!(phys.entry(ROOT, 0), 0x2000 | P | W);
    }

    #[test]
    fn low_window_mirror_repeats_the_leading_slots() {
        let phys = live_tree(P | W);
        phys.set_entry(ROOT, 1, 0x6000 | P | W);
        let walker = walker(&phys);
        let low_window = RtsWindow::new(VirtualAddress::new(1 << 39), 1 << 39);

        mirror_identity_slots(&walker, low_window);
        // Slot 1 takes slot 0, then slot 2 takes the already mirrored slot 1.
        assert_eq!(phys.entry(ROOT, 1), 0x2000 | P | W);
        assert_eq!(phys.entry(ROOT, 2), 0x2000 | P | W);
        assert_eq!(phys.entry(ROOT, 511), 0x2000 | P | W);
        assert_eq!(phys.entry(ROOT, 0), 0x2000 | P | W);
        assert_eq!(
            walker.leaf(VirtualAddress::new((1 << 39) + 0x5000)).unwrap().entry,
            0x5000 | P | XD
        );
    }

    #[test]
    fn overlapping_runtime_region_rules_out_old_and_new() {
        let phys = live_tree(P | W);
        let low_window = RtsWindow::new(VirtualAddress::new(1 << 39), 1 << 30);
        assert!(!can_old_and_new(&runtime_map((1 << 39) + 0x1000), low_window, &walker(&phys)));
        assert!(can_old_and_new(&runtime_map(0x5000), low_window, &walker(&phys)));
    }

    #[test]
    fn read_only_root_rules_out_old_and_new() {
        let phys = live_tree(P);
        assert!(!can_old_and_new(&runtime_map(0x5000), window(), &walker(&phys)));
    }

    #[test]
    fn feasibility_check_clears_stale_window_slots() {
        let phys = live_tree(P | W);
        phys.set_entry(ROOT, 510, 0x9000 | P | W);
        phys.set_entry(ROOT, 509, 0xa000 | P | W);
        assert!(can_old_and_new(&runtime_map(0x5000), window(), &walker(&phys)));
        assert_eq!(phys.entry(ROOT, 510), 0);
        assert_eq!(phys.entry(ROOT, 509), 0xa000 | P | W);
    }

    #[test]
    fn generic_quirks_map_and_unmap_each_page() {
        let phys = live_tree(P | W);
        let root = FakeRoot::new(PhysicalAddress::new(ROOT)).with_cache_flags(1 << 3);
        let mut alloc = BumpAlloc::new(0x10000..0x10000, 0x10000..0x20000);
        let mut ctx = RtsContext::new(&phys, &root, &mut alloc);

        let mut bytes = vec![0u8; 48];
        let mut vmap = DescriptorTable::new(&mut bytes, 48);
        let mut desc = MemoryDescriptor::new(
            MemoryType::RUNTIME_SERVICES_CODE,
            PhysicalAddress::new(0x5000),
            1,
            MemoryAttribute::RUNTIME,
        );
        desc.virtual_start = VirtualAddress::new(WINDOW_BASE + 0x20_0000);
        vmap.set(0, &desc);

        map_virtual_ranges(&mut ctx, &vmap);
        let leaf = ctx.walker().leaf(desc.virtual_start).unwrap();
        assert_eq!(leaf.entry, 0x5000 | P | XD);
        assert_eq!(phys.entry(ROOT, 510) & 0xfff, P | W | A | (1 << 3));

        unmap_virtual_ranges(ctx.walker(), &vmap);
        assert_eq!(phys.entry(ROOT, 510), 0);
        assert_eq!(phys.entry(ROOT, 0), 0x2000 | P | W);
        drop(ctx);
        assert!(alloc.history().iter().all(|&(_, pool)| pool == AllocationPool::Safe));
    }

    #[test]
    fn unmapped_source_page_stops_the_generic_mapping() {
        let phys = live_tree(P | W);
        let root = FakeRoot::new(PhysicalAddress::new(ROOT));
        let mut alloc = BumpAlloc::new(0x10000..0x10000, 0x10000..0x20000);
        let mut ctx = RtsContext::new(&phys, &root, &mut alloc);

        let mut bytes = vec![0u8; 48];
        let mut vmap = DescriptorTable::new(&mut bytes, 48);
        let mut desc = MemoryDescriptor::new(
            MemoryType::MMIO,
            PhysicalAddress::new(0xfee0_0000),
            1,
            MemoryAttribute::RUNTIME,
        );
        desc.virtual_start = VirtualAddress::new(WINDOW_BASE);
        vmap.set(0, &desc);

        map_virtual_ranges(&mut ctx, &vmap);
        assert_eq!(phys.entry(ROOT, 510), 0);
        drop(ctx);
        assert!(alloc.history().is_empty());
    }
}
