//! Kernel-facing memory ranges.
//!
//! The kernel does not consume firmware memory types directly. Each descriptor
//! is collapsed into a [`HandoffMemoryType`] and written as a [`HandoffRange`]
//! into the snapshot's extra region, one range per descriptor, in map order.

use crate::error::MemoryMapError;
use crate::{MemoryAttribute, MemoryDescriptor, MemoryMapSnapshot, MemoryType};
use log::trace;

/// Memory classification handed to the kernel.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum HandoffMemoryType {
    Available = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    Persistent = 7,
    RuntimeCode = 100,
    RuntimeData = 101,
    RuntimeMmio = 102,
    /// Loader-owned; becomes available once the kernel no longer needs it.
    Bootloader = 0xffff_ffff,
}

impl HandoffMemoryType {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            7 => Self::Persistent,
            100 => Self::RuntimeCode,
            101 => Self::RuntimeData,
            102 => Self::RuntimeMmio,
            0xffff_ffff => Self::Bootloader,
            _ => return None,
        })
    }

    /// Normalize a firmware descriptor.
    ///
    /// Runtime regions keep their identity only when a runtime window was
    /// requested; otherwise the kernel must leave them alone as reserved.
    #[must_use]
    pub const fn classify(desc: &MemoryDescriptor, runtime_window: bool) -> Self {
        match desc.ty {
            MemoryType::LOADER_CODE | MemoryType::LOADER_DATA => Self::Bootloader,
            MemoryType::BOOT_SERVICES_CODE => Self::Available,
            // The loader's pool allocations live here until the kernel takes over.
            MemoryType::BOOT_SERVICES_DATA => Self::Bootloader,
            MemoryType::CONVENTIONAL => {
                if desc.attribute.contains(MemoryAttribute::NON_VOLATILE) {
                    Self::Persistent
                } else {
                    Self::Available
                }
            }
            MemoryType::PERSISTENT_MEMORY => Self::Persistent,
            MemoryType::ACPI_RECLAIM => Self::AcpiReclaimable,
            MemoryType::ACPI_NON_VOLATILE => Self::AcpiNvs,
            MemoryType::RUNTIME_SERVICES_CODE if runtime_window => Self::RuntimeCode,
            MemoryType::RUNTIME_SERVICES_DATA if runtime_window => Self::RuntimeData,
            MemoryType::MMIO | MemoryType::MMIO_PORT_SPACE
                if runtime_window && desc.is_runtime() =>
            {
                Self::RuntimeMmio
            }
            _ => Self::Reserved,
        }
    }
}

/// One normalized range, laid out for the kernel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HandoffRange {
    pub base: u64,
    pub length: u64,
    pub kind: HandoffMemoryType,
    reserved: u32,
}

/// Bytes each [`HandoffRange`] occupies in the extra region.
pub const HANDOFF_RANGE_SIZE: usize = size_of::<HandoffRange>();

const _: () = assert!(HANDOFF_RANGE_SIZE == 24);

impl HandoffRange {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: HandoffMemoryType) -> Self {
        Self {
            base,
            length,
            kind,
            reserved: 0,
        }
    }

    #[must_use]
    pub const fn from_descriptor(desc: &MemoryDescriptor, runtime_window: bool) -> Self {
        Self::new(
            desc.physical_start.as_u64(),
            desc.size(),
            HandoffMemoryType::classify(desc, runtime_window),
        )
    }

    fn write_to(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.base.to_ne_bytes());
        out[8..16].copy_from_slice(&self.length.to_ne_bytes());
        out[16..20].copy_from_slice(&(self.kind as u32).to_ne_bytes());
        out[20..24].fill(0);
    }

    fn read_from(bytes: &[u8]) -> Option<Self> {
        let base = u64::from_ne_bytes(bytes.get(0..8)?.try_into().ok()?);
        let length = u64::from_ne_bytes(bytes.get(8..16)?.try_into().ok()?);
        let kind = u32::from_ne_bytes(bytes.get(16..20)?.try_into().ok()?);
        Some(Self::new(base, length, HandoffMemoryType::from_raw(kind)?))
    }
}

impl MemoryMapSnapshot {
    /// Write one [`HandoffRange`] per descriptor into the extra region.
    ///
    /// Returns the number of ranges written.
    ///
    /// # Errors
    /// [`MemoryMapError::ExtraRegionTooSmall`] if the snapshot was captured
    /// with fewer than [`HANDOFF_RANGE_SIZE`] extra bytes per entry.
    pub fn emit_handoff_ranges(&mut self, runtime_window: bool) -> Result<usize, MemoryMapError> {
        let per_entry = self.extra_per_entry();
        if per_entry < HANDOFF_RANGE_SIZE {
            return Err(MemoryMapError::ExtraRegionTooSmall {
                available: per_entry * self.len(),
                required: HANDOFF_RANGE_SIZE * self.len(),
            });
        }

        let count = self.len();
        for index in 0..count {
            let Some(desc) = self.get(index) else { break };
            let range = HandoffRange::from_descriptor(&desc, runtime_window);
            trace!(
                "range {index}: {:#x}+{:#x} {:?} -> {:?}",
                range.base, range.length, desc.ty, range.kind
            );
            let start = index * per_entry;
            range.write_to(&mut self.extra_region_mut()[start..start + HANDOFF_RANGE_SIZE]);
        }
        Ok(count)
    }

    /// Ranges previously written by [`emit_handoff_ranges`](Self::emit_handoff_ranges).
    pub fn handoff_ranges(&self) -> impl Iterator<Item = HandoffRange> + '_ {
        let per_entry = self.extra_per_entry();
        let region = if per_entry < HANDOFF_RANGE_SIZE {
            &[][..]
        } else {
            self.extra_region()
        };
        region
            .chunks_exact(per_entry.max(1))
            .filter_map(HandoffRange::read_from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use boot_addresses::PhysicalAddress;

    fn desc(ty: MemoryType, start: u64, attr: MemoryAttribute) -> MemoryDescriptor {
        MemoryDescriptor::new(ty, PhysicalAddress::new(start), 2, attr)
    }

    #[test]
    fn firmware_types_are_normalized() {
        let none = MemoryAttribute::default();
        let rt = MemoryAttribute::RUNTIME;
        let cases = [
            (MemoryType::LOADER_CODE, none, HandoffMemoryType::Bootloader),
            (MemoryType::BOOT_SERVICES_CODE, none, HandoffMemoryType::Available),
            (MemoryType::BOOT_SERVICES_DATA, none, HandoffMemoryType::Bootloader),
            (MemoryType::CONVENTIONAL, none, HandoffMemoryType::Available),
            (MemoryType::CONVENTIONAL, MemoryAttribute::NON_VOLATILE, HandoffMemoryType::Persistent),
            (MemoryType::PERSISTENT_MEMORY, none, HandoffMemoryType::Persistent),
            (MemoryType::ACPI_RECLAIM, none, HandoffMemoryType::AcpiReclaimable),
            (MemoryType::ACPI_NON_VOLATILE, none, HandoffMemoryType::AcpiNvs),
            (MemoryType::UNUSABLE, none, HandoffMemoryType::Reserved),
            (MemoryType::PAL_CODE, none, HandoffMemoryType::Reserved),
        ];
        for (ty, attr, expected) in cases {
            assert_eq!(
                HandoffMemoryType::classify(&desc(ty, 0, attr), true),
                expected,
                "{ty:?}"
            );
        }

        let code = desc(MemoryType::RUNTIME_SERVICES_CODE, 0, rt);
        let mmio = desc(MemoryType::MMIO, 0, rt);
        assert_eq!(HandoffMemoryType::classify(&code, true), HandoffMemoryType::RuntimeCode);
        assert_eq!(HandoffMemoryType::classify(&mmio, true), HandoffMemoryType::RuntimeMmio);
        assert_eq!(HandoffMemoryType::classify(&code, false), HandoffMemoryType::Reserved);
        assert_eq!(HandoffMemoryType::classify(&mmio, false), HandoffMemoryType::Reserved);
    }

    #[test]
    fn ranges_land_in_extra_region_in_map_order() {
        let descs = [
            desc(MemoryType::CONVENTIONAL, 0x10_0000, MemoryAttribute::WRITE_BACK),
            desc(MemoryType::RUNTIME_SERVICES_DATA, 0x20_0000, MemoryAttribute::RUNTIME),
        ];
        let mut map =
            MemoryMapSnapshot::from_descriptors(&descs, 48, 1, HANDOFF_RANGE_SIZE).unwrap();
        assert_eq!(map.emit_handoff_ranges(true).unwrap(), 2);

        let ranges: Vec<_> = map.handoff_ranges().collect();
        assert_eq!(
            ranges,
            [
                HandoffRange::new(0x10_0000, 0x2000, HandoffMemoryType::Available),
                HandoffRange::new(0x20_0000, 0x2000, HandoffMemoryType::RuntimeData),
            ]
        );
    }

    #[test]
    fn refuses_undersized_extra_region() {
        let descs = [desc(MemoryType::CONVENTIONAL, 0, MemoryAttribute::default())];
        let mut map = MemoryMapSnapshot::from_descriptors(&descs, 48, 1, 8).unwrap();
        assert!(map.emit_handoff_ranges(false).is_err());
        assert_eq!(map.handoff_ranges().count(), 0);
    }
}
