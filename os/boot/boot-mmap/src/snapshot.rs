use crate::MemoryDescriptor;
use crate::descriptor::{
    DESCRIPTOR_SIZE, DescriptorTable, Descriptors, read_descriptor, write_descriptor,
};
use crate::error::MemoryMapError;
use alloc::vec::Vec;
use boot_addresses::VirtualAddress;

/// The firmware's memory-map generation key.
///
/// `ExitBootServices` only succeeds when handed the key of the map that is
/// current at the instant of the call; any allocation in between bumps it.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct MapKey(pub usize);

/// 8-byte aligned, zero-initialized storage handed to the firmware.
///
/// Backed by `u64` words so that descriptors read from it are naturally
/// aligned even though all access is byte-offset based.
pub struct MapBuffer {
    words: Vec<u64>,
}

impl MapBuffer {
    /// A zero-length buffer, used to ask for the required size.
    #[must_use]
    pub const fn empty() -> Self {
        Self { words: Vec::new() }
    }

    /// Allocate at least `bytes` zeroed bytes.
    ///
    /// # Errors
    /// [`MemoryMapError::OutOfMemory`] if the allocator refuses the request.
    pub fn zeroed(bytes: usize) -> Result<Self, MemoryMapError> {
        let words_needed = bytes.div_ceil(size_of::<u64>());
        let mut words = Vec::new();
        words
            .try_reserve_exact(words_needed)
            .map_err(|_| MemoryMapError::OutOfMemory { requested: bytes })?;
        words.resize(words_needed, 0);
        Ok(Self { words })
    }

    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.words.len() * size_of::<u64>()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: any initialized `u64` slice is a valid byte slice of 8x the length.
        unsafe { core::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.byte_len()) }
    }

    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.byte_len();
        // SAFETY: as above; the borrow is unique.
        unsafe { core::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), len) }
    }

    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }
}

/// An owned copy of the firmware memory map.
///
/// Holds `len()` descriptors spaced `stride()` bytes apart, the generation
/// key it was captured with, and a caller-reserved *extra region* that starts
/// at the first 8-byte boundary after the map bytes. The buffer is released
/// exactly once, when the snapshot is dropped.
pub struct MemoryMapSnapshot {
    buffer: MapBuffer,
    map_size: usize,
    stride: usize,
    version: u32,
    key: MapKey,
    extra_per_entry: usize,
}

impl MemoryMapSnapshot {
    pub(crate) fn from_query(
        buffer: MapBuffer,
        map_size: usize,
        stride: usize,
        version: u32,
        key: MapKey,
        extra_per_entry: usize,
    ) -> Result<Self, MemoryMapError> {
        if stride < DESCRIPTOR_SIZE {
            return Err(MemoryMapError::InvalidStride {
                stride,
                minimum: DESCRIPTOR_SIZE,
            });
        }
        let snapshot = Self {
            buffer,
            map_size,
            stride,
            version,
            key,
            extra_per_entry,
        };
        let required = snapshot.extra_offset() + snapshot.len() * extra_per_entry;
        if required > snapshot.buffer.byte_len() {
            return Err(MemoryMapError::ExtraRegionTooSmall {
                available: snapshot.buffer.byte_len().saturating_sub(snapshot.extra_offset()),
                required: snapshot.len() * extra_per_entry,
            });
        }
        Ok(snapshot)
    }

    /// Build a snapshot from known descriptors, e.g. for tests and replays.
    ///
    /// # Errors
    /// Allocation failure or a stride too small for a descriptor.
    pub fn from_descriptors(
        descriptors: &[MemoryDescriptor],
        stride: usize,
        version: u32,
        extra_per_entry: usize,
    ) -> Result<Self, MemoryMapError> {
        if stride < DESCRIPTOR_SIZE {
            return Err(MemoryMapError::InvalidStride {
                stride,
                minimum: DESCRIPTOR_SIZE,
            });
        }
        let map_size = descriptors.len() * stride;
        let total = map_size.next_multiple_of(8) + descriptors.len() * extra_per_entry;
        let mut buffer = MapBuffer::zeroed(total)?;
        for (i, desc) in descriptors.iter().enumerate() {
            write_descriptor(buffer.bytes_mut(), stride, i, desc);
        }
        Self::from_query(buffer, map_size, stride, version, MapKey(0), extra_per_entry)
    }

    /// Number of descriptors.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.map_size / self.stride
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of map data reported by the firmware.
    #[must_use]
    pub const fn map_size(&self) -> usize {
        self.map_size
    }

    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub const fn key(&self) -> MapKey {
        self.key
    }

    #[must_use]
    pub const fn extra_per_entry(&self) -> usize {
        self.extra_per_entry
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<MemoryDescriptor> {
        if index >= self.len() {
            return None;
        }
        read_descriptor(self.map_bytes(), self.stride, index)
    }

    /// Iterate all descriptors in firmware order.
    #[must_use]
    pub fn iter(&self) -> Descriptors<'_> {
        Descriptors::new(self.map_bytes(), self.stride)
    }

    /// Stride-aware mutable view of the map.
    pub fn table_mut(&mut self) -> DescriptorTable<'_> {
        let (map, _) = self.buffer.bytes_mut().split_at_mut(self.map_size);
        DescriptorTable::new(map, self.stride)
    }

    /// Record the virtual address chosen for descriptor `index`.
    pub fn set_virtual_start(&mut self, index: usize, va: VirtualAddress) -> bool {
        self.table_mut().set_virtual_start(index, va)
    }

    /// The map bytes exactly as the firmware wrote them (`map_size` long).
    #[must_use]
    pub fn map_bytes(&self) -> &[u8] {
        &self.buffer.bytes()[..self.map_size]
    }

    /// Address of the first descriptor, for firmware calls taking the map.
    #[must_use]
    pub fn map_ptr(&self) -> *const u8 {
        self.buffer.bytes().as_ptr()
    }

    /// Byte offset of the extra region within the buffer.
    #[must_use]
    pub const fn extra_offset(&self) -> usize {
        self.map_size.next_multiple_of(8)
    }

    /// Per-entry metadata area following the map (`len() * extra_per_entry` bytes).
    #[must_use]
    pub fn extra_region(&self) -> &[u8] {
        let start = self.extra_offset();
        &self.buffer.bytes()[start..start + self.len() * self.extra_per_entry]
    }

    pub fn extra_region_mut(&mut self) -> &mut [u8] {
        let start = self.extra_offset();
        let len = self.len() * self.extra_per_entry;
        &mut self.buffer.bytes_mut()[start..start + len]
    }
}

impl core::fmt::Debug for MemoryMapSnapshot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryMapSnapshot")
            .field("entries", &self.len())
            .field("stride", &self.stride)
            .field("version", &self.version)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
