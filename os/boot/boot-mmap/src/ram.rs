use crate::{MemoryDescriptor, MemoryMapSnapshot, MemoryType};
use boot_addresses::PhysicalAddress;

/// Result of classifying a physical address against the memory map.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RamLookup {
    /// Some descriptor covering the address describes RAM.
    pub usable: bool,
    /// Some descriptor covers the address at all.
    pub in_map: bool,
}

/// Read-only RAM queries over a snapshot.
///
/// `memtop` is the highest exclusive end of any descriptor; nothing at or
/// above it is treated as RAM.
#[derive(Copy, Clone)]
pub struct RamMap<'a> {
    map: &'a MemoryMapSnapshot,
    memtop: PhysicalAddress,
}

impl<'a> RamMap<'a> {
    #[must_use]
    pub fn new(map: &'a MemoryMapSnapshot) -> Self {
        let memtop = map
            .iter()
            .map(|d| d.physical_end())
            .max()
            .unwrap_or_else(PhysicalAddress::zero);
        Self { map, memtop }
    }

    #[must_use]
    pub const fn memtop(&self) -> PhysicalAddress {
        self.memtop
    }

    #[must_use]
    pub fn lookup(&self, pa: PhysicalAddress) -> RamLookup {
        if pa >= self.memtop {
            return RamLookup::default();
        }

        let mut result = RamLookup::default();
        for desc in self.map.iter().filter(|d| d.contains(pa)) {
            result.in_map = true;
            if describes_ram(&desc) {
                result.usable = true;
                break;
            }
        }
        result
    }

    #[must_use]
    pub fn is_usable_ram(&self, pa: PhysicalAddress) -> bool {
        self.lookup(pa).usable
    }
}

const fn describes_ram(desc: &MemoryDescriptor) -> bool {
    matches!(
        desc.ty,
        MemoryType::LOADER_CODE
            | MemoryType::LOADER_DATA
            | MemoryType::BOOT_SERVICES_CODE
            | MemoryType::BOOT_SERVICES_DATA
            | MemoryType::RUNTIME_SERVICES_CODE
            | MemoryType::RUNTIME_SERVICES_DATA
            | MemoryType::CONVENTIONAL
            | MemoryType::ACPI_RECLAIM
            | MemoryType::ACPI_NON_VOLATILE
            | MemoryType::PERSISTENT_MEMORY
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryAttribute;

    fn desc(ty: MemoryType, start: u64, pages: u64) -> MemoryDescriptor {
        MemoryDescriptor::new(ty, PhysicalAddress::new(start), pages, MemoryAttribute::default())
    }

    fn snapshot(descs: &[MemoryDescriptor]) -> MemoryMapSnapshot {
        MemoryMapSnapshot::from_descriptors(descs, 48, 1, 0).unwrap()
    }

    #[test]
    fn classifies_ram_and_holes() {
        let map = snapshot(&[
            desc(MemoryType::CONVENTIONAL, 0x0, 0x100),
            desc(MemoryType::MMIO, 0x10_0000, 0x10),
            desc(MemoryType::ACPI_NON_VOLATILE, 0x20_0000, 1),
        ]);
        let ram = RamMap::new(&map);
        assert_eq!(ram.memtop().as_u64(), 0x20_1000);

        assert!(ram.is_usable_ram(PhysicalAddress::new(0x5000)));
        assert!(ram.is_usable_ram(PhysicalAddress::new(0x20_0fff)));

        let mmio = ram.lookup(PhysicalAddress::new(0x10_0000));
        assert!(mmio.in_map && !mmio.usable);

        let hole = ram.lookup(PhysicalAddress::new(0x18_0000));
        assert!(!hole.in_map && !hole.usable);
    }

    #[test]
    fn nothing_at_or_above_memtop_is_ram() {
        let map = snapshot(&[desc(MemoryType::CONVENTIONAL, 0x1000, 1)]);
        let ram = RamMap::new(&map);
        assert_eq!(ram.lookup(PhysicalAddress::new(0x2000)), RamLookup::default());
    }

    #[test]
    fn aliased_entries_prefer_ram() {
        let map = snapshot(&[
            desc(MemoryType::RESERVED, 0x0, 4),
            desc(MemoryType::LOADER_DATA, 0x1000, 1),
        ]);
        let ram = RamMap::new(&map);
        assert!(ram.is_usable_ram(PhysicalAddress::new(0x1800)));
        assert!(!ram.is_usable_ram(PhysicalAddress::new(0x2000)));
    }
}
