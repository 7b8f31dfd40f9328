use boot_addresses::VirtualAddress;
use boot_vmem::{ENTRIES_PER_TABLE, Level};
use core::ops::RangeInclusive;

/// Span of one level-4 entry (512 GiB).
pub const ROOT_SLOT_SPAN: u64 = 1 << 39;

bitflags::bitflags! {
    /// What the loader is willing to try when relocating runtime services.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Capabilities: u32 {
        /// Old (identity) and new mappings can both be live during the switch.
        /// Derived at run time; see [`can_old_and_new`](crate::can_old_and_new).
        const OLD_AND_NEW = 1 << 0;
        /// Call `ConvertPointer` once after the switch as a smoke test.
        const RTS_DO_TEST = 1 << 1;
        const SIMPLE = 1 << 2;
        const SIMPLE_GQ = 1 << 3;
        const SPARSE = 1 << 4;
        const COMPACT = 1 << 5;
        const CONTIG = 1 << 6;
    }
}

impl Capabilities {
    /// Every layout policy, without the run-time derived bits.
    pub const ALL_POLICIES: Self = Self::SIMPLE
        .union(Self::SIMPLE_GQ)
        .union(Self::SPARSE)
        .union(Self::COMPACT)
        .union(Self::CONTIG);
}

/// The virtual range the kernel reserves for runtime services.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RtsWindow {
    base: VirtualAddress,
    size: u64,
}

impl RtsWindow {
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        Self { base, size }
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Exclusive end, saturated at the top of the address space.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64().saturating_add(self.size)
    }

    /// A zero base or size means no window was asked for.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.base.as_u64() == 0 || self.size == 0
    }

    /// Whether the last byte of the window is addressable. A window may end
    /// exactly at the top of the address space.
    #[must_use]
    pub const fn fits_address_space(&self) -> bool {
        self.size == 0 || self.base.as_u64().checked_add(self.size - 1).is_some()
    }

    /// Whether the window starts on a level-4 entry boundary.
    #[must_use]
    pub const fn is_root_aligned(&self) -> bool {
        self.base.is_aligned(ROOT_SLOT_SPAN)
    }

    /// Whether `[start, end)` intersects the window.
    #[must_use]
    pub const fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.end() && end > self.base.as_u64()
    }

    /// Level-4 slot of the window base.
    #[must_use]
    pub const fn first_slot(&self) -> usize {
        Level::ROOT.index_of(self.base)
    }

    /// Level-4 slots the window covers.
    #[must_use]
    pub const fn root_slots(&self) -> RangeInclusive<usize> {
        let first = self.first_slot();
        if self.size == 0 {
            return first..=first;
        }
        let last_va = VirtualAddress::new(self.end() - 1);
        let last = Level::ROOT.index_of(last_va);
        if last < first {
            first..=ENTRIES_PER_TABLE - 1
        } else {
            first..=last
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_BASE: u64 = 0xffff_ff00_0000_0000;

    #[test]
    fn slots_of_a_high_window() {
        let window = RtsWindow::new(VirtualAddress::new(WINDOW_BASE), 64 << 30);
        assert!(window.is_root_aligned());
        assert_eq!(window.first_slot(), 510);
        assert_eq!(window.root_slots(), 510..=510);

        let wide = RtsWindow::new(VirtualAddress::new(WINDOW_BASE), 1 << 40);
        assert_eq!(wide.root_slots(), 510..=511);
    }

    #[test]
    fn overlap_is_half_open() {
        let window = RtsWindow::new(VirtualAddress::new(1 << 39), 1 << 30);
        assert!(!window.overlaps(0, 1 << 39));
        assert!(window.overlaps(0, (1 << 39) + 1));
        assert!(window.overlaps((1 << 39) + 0x1000, (1 << 39) + 0x2000));
        assert!(!window.overlaps((1 << 39) + (1 << 30), u64::MAX));
    }

    #[test]
    fn unaligned_and_empty_windows() {
        assert!(!RtsWindow::new(VirtualAddress::new(WINDOW_BASE + 0x1000), 1 << 30).is_root_aligned());
        assert!(RtsWindow::new(VirtualAddress::zero(), 1 << 30).is_empty());
        assert!(RtsWindow::new(VirtualAddress::new(WINDOW_BASE), 0).is_empty());
    }

    #[test]
    fn window_running_past_the_top_does_not_fit() {
        // Ends exactly at 2^64: still representable as an exclusive end.
        let top = RtsWindow::new(VirtualAddress::new(WINDOW_BASE), 1 << 40);
        assert!(top.fits_address_space());

        let past = RtsWindow::new(VirtualAddress::new(0xffff_ff80_0000_0000), 1 << 40);
        assert!(past.is_root_aligned());
        assert!(!past.fits_address_space());
        assert_eq!(past.end(), u64::MAX);
    }
}
