#![allow(dead_code)]

use boot_addresses::PhysicalAddress;
use boot_handoff::{BootServices, FirmwareRuntime};
use boot_mmap::{
    DescriptorTable, FirmwareStatus, MapBuffer, MapKey, MapQuery, MemoryAttribute,
    MemoryDescriptor, MemoryMapSource, MemoryType,
};
use boot_rts::RuntimeServices;
use boot_vmem::testing::TestPhys;

pub const STRIDE: usize = 48;
pub const ROOT: u64 = 0x1000;
pub const WINDOW_BASE: u64 = 0xffff_ff00_0000_0000;

const P: u64 = 1 << 0;
const W: u64 = 1 << 1;

/// Firmware behavior and a record of what the handoff did to it.
pub struct Script {
    pub descriptors: Vec<MemoryDescriptor>,
    pub key: usize,
    /// Number of `terminate` calls that report a stale key before one succeeds.
    pub stale_keys: usize,
    pub exit_error: Option<FirmwareStatus>,
    pub svam_status: FirmwareStatus,

    pub terminate_keys: Vec<usize>,
    pub exited: bool,
    pub neutralized: bool,
    pub net_disabled: bool,
    pub svam_calls: Vec<(usize, usize, u32, u64)>,
}

impl Script {
    pub fn new(descriptors: Vec<MemoryDescriptor>) -> Self {
        Self {
            descriptors,
            key: 100,
            stale_keys: 0,
            exit_error: None,
            svam_status: FirmwareStatus::Success,
            terminate_keys: Vec::new(),
            exited: false,
            neutralized: false,
            net_disabled: false,
            svam_calls: Vec::new(),
        }
    }
}

pub struct FakeBoot<'a>(pub &'a mut Script);

impl MemoryMapSource for FakeBoot<'_> {
    fn query_memory_map(&mut self, buffer: &mut MapBuffer) -> MapQuery {
        assert!(!self.0.exited, "memory map queried after exit");
        let required = self.0.descriptors.len() * STRIDE;
        if buffer.byte_len() < required {
            return MapQuery {
                status: FirmwareStatus::BufferTooSmall,
                map_size: required,
                key: MapKey(self.0.key),
                stride: 0,
                version: 1,
            };
        }

        let mut table = DescriptorTable::new(&mut buffer.bytes_mut()[..required], STRIDE);
        for (i, desc) in self.0.descriptors.iter().enumerate() {
            table.set(i, desc);
        }
        // Every filled buffer is a fresh allocation from the firmware's view.
        self.0.key += 1;
        MapQuery {
            status: FirmwareStatus::Success,
            map_size: required,
            key: MapKey(self.0.key),
            stride: STRIDE,
            version: 1,
        }
    }
}

impl<'a> BootServices for FakeBoot<'a> {
    type Runtime = FakeRuntime<'a>;

    fn disable_network_controllers(&mut self) {
        self.0.net_disabled = true;
    }

    fn terminate(self, key: MapKey) -> Result<FakeRuntime<'a>, (Self, FirmwareStatus)> {
        self.0.terminate_keys.push(key.0);
        if self.0.stale_keys > 0 {
            self.0.stale_keys -= 1;
            return Err((self, FirmwareStatus::InvalidParameter));
        }
        if key.0 != self.0.key {
            return Err((self, FirmwareStatus::InvalidParameter));
        }
        if let Some(status) = self.0.exit_error {
            return Err((self, status));
        }
        self.0.exited = true;
        Ok(FakeRuntime(self.0))
    }
}

pub struct FakeRuntime<'a>(pub &'a mut Script);

impl RuntimeServices for FakeRuntime<'_> {
    fn set_virtual_address_map(
        &mut self,
        map_size: usize,
        stride: usize,
        version: u32,
        map: PhysicalAddress,
    ) -> FirmwareStatus {
        self.0.svam_calls.push((map_size, stride, version, map.as_u64()));
        self.0.svam_status
    }

    fn convert_pointer(&mut self, _pointer: &mut u64) -> FirmwareStatus {
        FirmwareStatus::Success
    }
}

impl FirmwareRuntime for FakeRuntime<'_> {
    fn neutralize_handles(&mut self) {
        self.0.neutralized = true;
    }
}

pub fn desc(ty: MemoryType, pa: u64, pages: u64, attribute: MemoryAttribute) -> MemoryDescriptor {
    MemoryDescriptor::new(ty, PhysicalAddress::new(pa), pages, attribute)
}

/// Loader data below 256 KiB (where the page tables live), conventional
/// memory up to 1 MiB, and two runtime regions at 2 GiB.
pub fn platform_map() -> Vec<MemoryDescriptor> {
    vec![
        desc(MemoryType::LOADER_DATA, 0, 0x40, MemoryAttribute::WRITE_BACK),
        desc(MemoryType::CONVENTIONAL, 0x4_0000, 0xc0, MemoryAttribute::WRITE_BACK),
        desc(
            MemoryType::RUNTIME_SERVICES_CODE,
            0x8000_0000,
            0x10,
            MemoryAttribute::RUNTIME.union(MemoryAttribute::WRITE_BACK),
        ),
        desc(
            MemoryType::RUNTIME_SERVICES_DATA,
            0x8001_0000,
            0x20,
            MemoryAttribute::RUNTIME.union(MemoryAttribute::WRITE_BACK),
        ),
        desc(MemoryType::MMIO, 0xfec0_0000, 1, MemoryAttribute::UNCACHEABLE),
    ]
}

/// A firmware tree at 0x1000 identity-mapping the first 256 KiB.
pub fn firmware_tables() -> TestPhys {
    let phys = TestPhys::with_frames(256);
    phys.set_entry(ROOT, 0, 0x2000 | P | W);
    phys.set_entry(0x2000, 0, 0x3000 | P | W);
    phys.set_entry(0x3000, 0, 0x4000 | P | W);
    for page in 0..0x40usize {
        phys.set_entry(0x4000, page, ((page as u64) << 12) | P | W);
    }
    phys
}
