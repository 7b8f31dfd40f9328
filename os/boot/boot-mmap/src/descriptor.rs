//! # Firmware Memory Descriptors
//!
//! The on-wire layout of a UEFI memory descriptor and stride-aware access to
//! arrays of them. Firmware may report a descriptor stride larger than
//! [`DESCRIPTOR_SIZE`] to append fields of future revisions, so every array
//! access in the workspace goes through [`DescriptorTable`] and advances by
//! the stride, never by `size_of::<MemoryDescriptor>()`.

use boot_addresses::{PhysicalAddress, VirtualAddress, pages_to_bytes};
use core::fmt;

/// Memory type tag of a descriptor (`EFI_MEMORY_TYPE`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryType(pub u32);

impl MemoryType {
    pub const RESERVED: Self = Self(0);
    pub const LOADER_CODE: Self = Self(1);
    pub const LOADER_DATA: Self = Self(2);
    pub const BOOT_SERVICES_CODE: Self = Self(3);
    pub const BOOT_SERVICES_DATA: Self = Self(4);
    pub const RUNTIME_SERVICES_CODE: Self = Self(5);
    pub const RUNTIME_SERVICES_DATA: Self = Self(6);
    pub const CONVENTIONAL: Self = Self(7);
    pub const UNUSABLE: Self = Self(8);
    pub const ACPI_RECLAIM: Self = Self(9);
    pub const ACPI_NON_VOLATILE: Self = Self(10);
    pub const MMIO: Self = Self(11);
    pub const MMIO_PORT_SPACE: Self = Self(12);
    pub const PAL_CODE: Self = Self(13);
    pub const PERSISTENT_MEMORY: Self = Self(14);

    /// Code or data owned by a runtime driver image.
    #[must_use]
    pub const fn is_runtime_image(self) -> bool {
        matches!(
            self,
            Self::RUNTIME_SERVICES_CODE | Self::RUNTIME_SERVICES_DATA
        )
    }
}

impl fmt::Debug for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::RESERVED => "Reserved",
            Self::LOADER_CODE => "LoaderCode",
            Self::LOADER_DATA => "LoaderData",
            Self::BOOT_SERVICES_CODE => "BootServicesCode",
            Self::BOOT_SERVICES_DATA => "BootServicesData",
            Self::RUNTIME_SERVICES_CODE => "RuntimeServicesCode",
            Self::RUNTIME_SERVICES_DATA => "RuntimeServicesData",
            Self::CONVENTIONAL => "Conventional",
            Self::UNUSABLE => "Unusable",
            Self::ACPI_RECLAIM => "AcpiReclaim",
            Self::ACPI_NON_VOLATILE => "AcpiNvs",
            Self::MMIO => "Mmio",
            Self::MMIO_PORT_SPACE => "MmioPortSpace",
            Self::PAL_CODE => "PalCode",
            Self::PERSISTENT_MEMORY => "Persistent",
            Self(other) => return write!(f, "Type({other})"),
        };
        f.write_str(name)
    }
}

/// Attribute bits of a descriptor (`EFI_MEMORY_*`).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct MemoryAttribute(pub u64);

impl MemoryAttribute {
    pub const UNCACHEABLE: Self = Self(0x1);
    pub const WRITE_BACK: Self = Self(0x8);
    pub const WRITE_PROTECT: Self = Self(0x1000);
    pub const READ_PROTECT: Self = Self(0x2000);
    pub const EXECUTE_PROTECT: Self = Self(0x4000);
    pub const NON_VOLATILE: Self = Self(0x8000);
    /// The region must be given a virtual mapping for runtime services.
    pub const RUNTIME: Self = Self(1 << 63);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Debug for MemoryAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attr({:#x})", self.0)
    }
}

/// One firmware memory descriptor (`EFI_MEMORY_DESCRIPTOR`, 40 bytes).
///
/// Everything except [`virtual_start`](Self::virtual_start) is read-only for
/// the loader; the virtual start is filled in when runtime services are
/// relocated.
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct MemoryDescriptor {
    pub ty: MemoryType,
    padding: u32,
    pub physical_start: PhysicalAddress,
    pub virtual_start: VirtualAddress,
    pub page_count: u64,
    pub attribute: MemoryAttribute,
}

/// Size of the descriptor layout this crate understands.
pub const DESCRIPTOR_SIZE: usize = size_of::<MemoryDescriptor>();

const _: () = {
    assert!(DESCRIPTOR_SIZE == 40);
    assert!(align_of::<MemoryDescriptor>() == 8);
};

impl MemoryDescriptor {
    #[must_use]
    pub const fn new(
        ty: MemoryType,
        physical_start: PhysicalAddress,
        page_count: u64,
        attribute: MemoryAttribute,
    ) -> Self {
        Self {
            ty,
            padding: 0,
            physical_start,
            virtual_start: VirtualAddress::zero(),
            page_count,
            attribute,
        }
    }

    /// Length of the region in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        pages_to_bytes(self.page_count)
    }

    /// Exclusive physical end of the region.
    #[must_use]
    pub const fn physical_end(&self) -> PhysicalAddress {
        self.physical_start.end_of(self.page_count)
    }

    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.physical_start.as_u64() && pa.as_u64() < self.physical_end().as_u64()
    }

    #[must_use]
    pub const fn is_runtime(&self) -> bool {
        self.attribute.contains(MemoryAttribute::RUNTIME)
    }
}

impl fmt::Debug for MemoryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDescriptor")
            .field("ty", &self.ty)
            .field("phys", &self.physical_start)
            .field("virt", &self.virtual_start)
            .field("pages", &self.page_count)
            .field("attr", &self.attribute)
            .finish()
    }
}

/// A mutable, stride-aware view over an array of descriptors.
///
/// Used both for the firmware's own map and for tables the loader builds
/// (the virtual map handed to `SetVirtualAddressMap`), which must use the
/// firmware's stride as well.
pub struct DescriptorTable<'a> {
    bytes: &'a mut [u8],
    stride: usize,
}

impl<'a> DescriptorTable<'a> {
    /// Wrap `bytes` holding `bytes.len() / stride` descriptors.
    ///
    /// # Panics
    /// Debug-asserts that the stride can hold a descriptor.
    #[must_use]
    pub fn new(bytes: &'a mut [u8], stride: usize) -> Self {
        debug_assert!(stride >= DESCRIPTOR_SIZE);
        Self { bytes, stride }
    }

    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len() / self.stride
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<MemoryDescriptor> {
        read_descriptor(self.bytes, self.stride, index)
    }

    /// Raw bytes of entry `index`, including any trailing fields beyond the
    /// known layout.
    #[must_use]
    pub fn raw_entry(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.stride)?;
        self.bytes.get(start..start + self.stride)
    }

    /// Copy a full entry, trailing fields included.
    ///
    /// Returns `false` if `index` is out of range or `raw` is not one stride long.
    pub fn copy_raw_entry(&mut self, index: usize, raw: &[u8]) -> bool {
        let Some(start) = index.checked_mul(self.stride) else {
            return false;
        };
        match self.bytes.get_mut(start..start + self.stride) {
            Some(dst) if dst.len() == raw.len() => {
                dst.copy_from_slice(raw);
                true
            }
            _ => false,
        }
    }

    /// Overwrite the known fields of entry `index`.
    pub fn set(&mut self, index: usize, desc: &MemoryDescriptor) -> bool {
        write_descriptor(self.bytes, self.stride, index, desc)
    }

    /// Update only the virtual start of entry `index`.
    pub fn set_virtual_start(&mut self, index: usize, va: VirtualAddress) -> bool {
        match self.get(index) {
            Some(mut desc) => {
                desc.virtual_start = va;
                self.set(index, &desc)
            }
            None => false,
        }
    }

    pub fn iter(&self) -> Descriptors<'_> {
        Descriptors::new(self.bytes, self.stride)
    }
}

/// Finite, restartable iterator over stride-separated descriptors.
#[derive(Clone)]
pub struct Descriptors<'a> {
    bytes: &'a [u8],
    stride: usize,
    index: usize,
}

impl<'a> Descriptors<'a> {
    pub(crate) const fn new(bytes: &'a [u8], stride: usize) -> Self {
        Self {
            bytes,
            stride,
            index: 0,
        }
    }
}

impl Iterator for Descriptors<'_> {
    type Item = MemoryDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let desc = read_descriptor(self.bytes, self.stride, self.index)?;
        self.index += 1;
        Some(desc)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.bytes.len() / self.stride).saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Descriptors<'_> {}

pub(crate) fn read_descriptor(bytes: &[u8], stride: usize, index: usize) -> Option<MemoryDescriptor> {
    let start = index.checked_mul(stride)?;
    let entry = bytes.get(start..start.checked_add(stride)?)?;
    let known = entry.get(..DESCRIPTOR_SIZE)?;
    // SAFETY: `known` spans DESCRIPTOR_SIZE bytes and every bit pattern is a
    // valid `MemoryDescriptor` (plain integers only).
    Some(unsafe { known.as_ptr().cast::<MemoryDescriptor>().read_unaligned() })
}

pub(crate) fn write_descriptor(
    bytes: &mut [u8],
    stride: usize,
    index: usize,
    desc: &MemoryDescriptor,
) -> bool {
    let Some(start) = index.checked_mul(stride) else {
        return false;
    };
    let Some(entry) = bytes.get_mut(start..start + stride) else {
        return false;
    };
    let Some(known) = entry.get_mut(..DESCRIPTOR_SIZE) else {
        return false;
    };
    // SAFETY: `known` spans DESCRIPTOR_SIZE writable bytes.
    unsafe {
        known
            .as_mut_ptr()
            .cast::<MemoryDescriptor>()
            .write_unaligned(*desc);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRIDE: usize = 48;

    fn conventional(start: u64, pages: u64) -> MemoryDescriptor {
        MemoryDescriptor::new(
            MemoryType::CONVENTIONAL,
            PhysicalAddress::new(start),
            pages,
            MemoryAttribute::WRITE_BACK,
        )
    }

    #[test]
    fn iteration_advances_by_stride_not_size() {
        let mut bytes = [0xAAu8; STRIDE * 3];
        let mut table = DescriptorTable::new(&mut bytes, STRIDE);
        assert_eq!(table.len(), 3);
        for i in 0..3 {
            assert!(table.set(i, &conventional(0x1000 * (i as u64 + 1), 1)));
        }

        let starts: Vec<u64> = table.iter().map(|d| d.physical_start.as_u64()).collect();
        assert_eq!(starts, [0x1000, 0x2000, 0x3000]);

        // Trailing bytes of each stride slot are left alone.
        assert_eq!(table.raw_entry(0).unwrap()[DESCRIPTOR_SIZE..], [0xAA; 8]);
    }

    #[test]
    fn set_virtual_start_only_touches_that_field() {
        let mut bytes = [0u8; STRIDE * 2];
        let mut table = DescriptorTable::new(&mut bytes, STRIDE);
        table.set(1, &conventional(0x8000, 4));
        assert!(table.set_virtual_start(1, VirtualAddress::new(0xffff_8000_0000_8000)));

        let desc = table.get(1).unwrap();
        assert_eq!(desc.physical_start.as_u64(), 0x8000);
        assert_eq!(desc.page_count, 4);
        assert_eq!(desc.virtual_start.as_u64(), 0xffff_8000_0000_8000);
        assert!(!table.set_virtual_start(2, VirtualAddress::zero()));
    }

    #[test]
    fn iterator_is_restartable() {
        let mut bytes = [0u8; STRIDE * 2];
        let mut table = DescriptorTable::new(&mut bytes, STRIDE);
        table.set(0, &conventional(0, 1));
        table.set(1, &conventional(0x1000, 1));
        let iter = table.iter();
        assert_eq!(iter.clone().count(), 2);
        assert_eq!(iter.len(), 2);
    }

    #[test]
    fn region_bounds_are_exclusive() {
        let desc = conventional(0x10_0000, 2);
        assert!(desc.contains(PhysicalAddress::new(0x10_1fff)));
        assert!(!desc.contains(PhysicalAddress::new(0x10_2000)));
        assert_eq!(desc.size(), 0x2000);
    }
}
