//! # Memory-Map Acquisition
//!
//! `GetMemoryMap` has two awkward properties: the size it reports is only
//! true until the next allocation (and allocating the buffer is itself an
//! allocation, which may split a free region and add a descriptor), and the
//! descriptor stride reported alongside a "buffer too small" answer is not
//! guaranteed to be meaningful. [`get_memory_map`] deals with both by
//! over-allocating twice:
//!
//! ```text
//!  size(empty)         ─► size S, stride unknown
//!  alloc 2·S, query    ─► authoritative stride D, size S'
//!  alloc 2·2·S + extra ─► final query, snapshot + key
//!  (any "too small"    ─► start over with the new size)
//! ```

use crate::error::MemoryMapError;
use crate::snapshot::{MapBuffer, MapKey, MemoryMapSnapshot};
use crate::{DESCRIPTOR_SIZE, FirmwareStatus};
use log::{debug, trace};

/// Upper bound on restarts caused by a concurrently growing map.
pub const MAX_QUERY_ROUNDS: usize = 32;

/// Everything a single `GetMemoryMap` call reports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MapQuery {
    pub status: FirmwareStatus,
    /// Bytes written, or bytes required when `status` is `BufferTooSmall`.
    pub map_size: usize,
    pub key: MapKey,
    pub stride: usize,
    pub version: u32,
}

/// The firmware call behind [`get_memory_map`].
pub trait MemoryMapSource {
    /// Fill `buffer` with the current memory map.
    ///
    /// A zero-length buffer asks for the required size and is expected to answer
    /// [`FirmwareStatus::BufferTooSmall`].
    fn query_memory_map(&mut self, buffer: &mut MapBuffer) -> MapQuery;
}

/// Capture the current memory map into caller-owned memory.
///
/// `extra_bytes_per_entry` reserves room after the map for per-descriptor
/// metadata the caller derives later (see [`MemoryMapSnapshot::extra_region`]).
/// The returned snapshot carries the generation key of this exact capture.
///
/// # Errors
/// * [`MemoryMapError::Firmware`] for any status other than success or
///   "buffer too small".
/// * [`MemoryMapError::OutOfMemory`] if a buffer cannot be allocated.
/// * [`MemoryMapError::TooManyRounds`] if the map never settles.
pub fn get_memory_map<F>(
    firmware: &mut F,
    extra_bytes_per_entry: usize,
) -> Result<MemoryMapSnapshot, MemoryMapError>
where
    F: MemoryMapSource + ?Sized,
{
    for round in 1..=MAX_QUERY_ROUNDS {
        let sizing = firmware.query_memory_map(&mut MapBuffer::empty());
        match sizing.status {
            FirmwareStatus::BufferTooSmall => {}
            FirmwareStatus::Success => return Err(MemoryMapError::UnexpectedSizingSuccess),
            status => return Err(MemoryMapError::Firmware(status)),
        }
        trace!(
            "memory map needs {} bytes (stride hint {})",
            sizing.map_size, sizing.stride
        );

        // Headroom: allocating this buffer may itself add descriptors.
        let mut size = doubled(sizing.map_size)?;
        let mut buffer = MapBuffer::zeroed(size)?;
        let learned = firmware.query_memory_map(&mut buffer);
        match learned.status {
            FirmwareStatus::Success => {}
            FirmwareStatus::BufferTooSmall => {
                debug!("memory map grew past {size} bytes, round {round}");
                continue;
            }
            status => return Err(MemoryMapError::Firmware(status)),
        }
        if learned.stride < DESCRIPTOR_SIZE {
            return Err(MemoryMapError::InvalidStride {
                stride: learned.stride,
                minimum: DESCRIPTOR_SIZE,
            });
        }
        drop(buffer);

        // One more doubling for the final allocation, plus the caller's extra
        // region sized for the worst-case descriptor count.
        size = doubled(size)?;
        let extra = (size / learned.stride)
            .checked_mul(extra_bytes_per_entry)
            .ok_or(MemoryMapError::SizeOverflow)?;
        let total = size
            .checked_add(extra)
            .and_then(|v| v.checked_add(size_of::<u64>()))
            .ok_or(MemoryMapError::SizeOverflow)?;
        let mut buffer = MapBuffer::zeroed(total)?;
        let fin = firmware.query_memory_map(&mut buffer);
        match fin.status {
            FirmwareStatus::Success => {}
            FirmwareStatus::BufferTooSmall => {
                debug!("memory map grew past {total} bytes, round {round}");
                continue;
            }
            status => return Err(MemoryMapError::Firmware(status)),
        }

        match MemoryMapSnapshot::from_query(
            buffer,
            fin.map_size,
            fin.stride,
            fin.version,
            fin.key,
            extra_bytes_per_entry,
        ) {
            // No logging from here on: the caller's next firmware call has
            // to be `ExitBootServices` with this key.
            Ok(snapshot) => return Ok(snapshot),
            // The map outgrew the room reserved for the extra region.
            Err(MemoryMapError::ExtraRegionTooSmall { .. }) => {
                debug!("memory map left no room for metadata, round {round}");
            }
            Err(e) => return Err(e),
        }
    }

    Err(MemoryMapError::TooManyRounds(MAX_QUERY_ROUNDS))
}

fn doubled(size: usize) -> Result<usize, MemoryMapError> {
    size.checked_mul(2).ok_or(MemoryMapError::SizeOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryAttribute, MemoryDescriptor, MemoryType};
    use alloc::vec::Vec;
    use boot_addresses::PhysicalAddress;

    const STRIDE: usize = 48;

    /// Scripted firmware: serves `entries` descriptors and can grow the map
    /// by one descriptor every time a buffer of at least one byte is filled.
    struct FakeFirmware {
        entries: usize,
        grow_on_fill: usize,
        sizing_stride: usize,
        key: usize,
        buffer_sizes: Vec<usize>,
        fail_with: Option<FirmwareStatus>,
    }

    impl FakeFirmware {
        fn new(entries: usize) -> Self {
            Self {
                entries,
                grow_on_fill: 0,
                sizing_stride: 0,
                key: 100,
                buffer_sizes: Vec::new(),
                fail_with: None,
            }
        }

        fn required(&self) -> usize {
            self.entries * STRIDE
        }
    }

    impl MemoryMapSource for FakeFirmware {
        fn query_memory_map(&mut self, buffer: &mut MapBuffer) -> MapQuery {
            self.buffer_sizes.push(buffer.byte_len());
            if let Some(status) = self.fail_with {
                return MapQuery {
                    status,
                    map_size: 0,
                    key: MapKey(0),
                    stride: 0,
                    version: 0,
                };
            }

            if buffer.byte_len() < self.required() {
                return MapQuery {
                    status: FirmwareStatus::BufferTooSmall,
                    map_size: self.required(),
                    key: MapKey(self.key),
                    stride: self.sizing_stride,
                    version: 1,
                };
            }

            for i in 0..self.entries {
                let desc = MemoryDescriptor::new(
                    MemoryType::CONVENTIONAL,
                    PhysicalAddress::new(0x1000 * i as u64),
                    1,
                    MemoryAttribute::WRITE_BACK,
                );
                crate::descriptor::write_descriptor(buffer.bytes_mut(), STRIDE, i, &desc);
            }
            let query = MapQuery {
                status: FirmwareStatus::Success,
                map_size: self.required(),
                key: MapKey(self.key),
                stride: STRIDE,
                version: 1,
            };
            self.entries += self.grow_on_fill;
            self.key += 1;
            query
        }
    }

    #[test]
    fn doubles_twice_and_reserves_extra_per_entry() {
        let mut fw = FakeFirmware::new(4);
        let snapshot = get_memory_map(&mut fw, 16).unwrap();

        let first = 4 * STRIDE;
        let second = 2 * first;
        let third = 2 * second + (2 * second / STRIDE) * 16 + 8;
        // Buffers are rounded up to whole u64 words.
        assert_eq!(
            fw.buffer_sizes,
            [0, second, third.next_multiple_of(8)]
        );
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot.stride(), STRIDE);
        assert_eq!(snapshot.key(), MapKey(101));
        assert_eq!(snapshot.extra_region().len(), 4 * 16);
    }

    #[test]
    fn sizing_stride_is_not_trusted() {
        let mut fw = FakeFirmware::new(2);
        fw.sizing_stride = 0;
        let snapshot = get_memory_map(&mut fw, 0).unwrap();
        assert_eq!(snapshot.stride(), STRIDE);
        assert_eq!(snapshot.iter().nth(1).unwrap().physical_start.as_u64(), 0x1000);
    }

    #[test]
    fn growth_between_calls_is_absorbed_by_headroom() {
        let mut fw = FakeFirmware::new(3);
        fw.grow_on_fill = 1;
        let snapshot = get_memory_map(&mut fw, 0).unwrap();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(fw.buffer_sizes.len(), 3);
    }

    #[test]
    fn sizing_failures_other_than_too_small_are_fatal() {
        let mut fw = FakeFirmware::new(3);
        fw.fail_with = Some(FirmwareStatus::Unsupported);
        let err = get_memory_map(&mut fw, 0).unwrap_err();
        assert!(matches!(
            err,
            MemoryMapError::Firmware(FirmwareStatus::Unsupported)
        ));
        assert_eq!(fw.buffer_sizes, [0]);
    }
}
