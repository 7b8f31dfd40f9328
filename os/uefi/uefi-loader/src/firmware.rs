//! Firmware access for the handoff, straight through the raw system table.
//!
//! [`BootToken`] is the only way to reach boot services; terminating them
//! consumes it and yields a [`RuntimeToken`], which can only reach runtime
//! services. Memory-map queries, `ExitBootServices` and the runtime calls go
//! through the raw tables because the handoff has to control every allocation
//! in between them.

#![allow(unsafe_code)]

use crate::logger::UefiLogger;
use crate::memory::boot_services_exited;
use crate::systab::neutralize_system_table;
use boot_addresses::PhysicalAddress;
use boot_handoff::{BootServices, FirmwareRuntime};
use boot_mmap::{FirmwareStatus, MapBuffer, MapKey, MapQuery, MemoryMapSource};
use boot_rts::RuntimeServices;
use core::ffi::c_void;
use core::ptr::NonNull;
use log::{debug, warn};
use uefi::boot;
use uefi::proto::network::snp::SimpleNetwork;
use uefi_raw::table::boot::{BootServices as RawBootServices, MemoryDescriptor};
use uefi_raw::table::runtime::RuntimeServices as RawRuntimeServices;
use uefi_raw::table::system::SystemTable;

/// Live boot services.
pub struct BootToken {
    system_table: NonNull<SystemTable>,
    boot: NonNull<RawBootServices>,
}

impl BootToken {
    /// # Safety
    /// Boot services must still be active, and this must be the only token.
    pub unsafe fn acquire() -> Option<Self> {
        let system_table = uefi::table::system_table_raw()?;
        // SAFETY: the firmware handed us a valid system table.
        let boot = NonNull::new(unsafe { system_table.as_ref() }.boot_services)?;
        Some(Self { system_table, boot })
    }

    const fn boot_services(&self) -> &RawBootServices {
        // SAFETY: valid until `terminate` consumes the token.
        unsafe { self.boot.as_ref() }
    }
}

impl MemoryMapSource for BootToken {
    #[allow(clippy::cast_ptr_alignment)]
    fn query_memory_map(&mut self, buffer: &mut MapBuffer) -> MapQuery {
        let mut map_size = buffer.byte_len();
        let mut key = 0usize;
        let mut stride = 0usize;
        let mut version = 0u32;
        let map = buffer.as_mut_ptr().cast::<MemoryDescriptor>();

        // SAFETY: `map` points to `map_size` writable, 8-aligned bytes.
        let status = unsafe {
            (self.boot_services().get_memory_map)(
                &raw mut map_size,
                map,
                &raw mut key,
                &raw mut stride,
                &raw mut version,
            )
        };
        MapQuery {
            status: FirmwareStatus::from_raw(status.0),
            map_size,
            key: MapKey(key),
            stride,
            version,
        }
    }
}

impl BootServices for BootToken {
    type Runtime = RuntimeToken;

    fn disable_network_controllers(&mut self) {
        let Ok(handles) = boot::find_handles::<SimpleNetwork>() else {
            debug!("no network controllers to disable");
            return;
        };
        for handle in handles {
            match boot::disconnect_controller(handle, None, None) {
                Ok(()) => debug!("disconnected drivers from {handle:?}"),
                Err(e) => debug!("cannot disconnect {handle:?}: {:?}", e.status()),
            }
        }
    }

    fn terminate(self, key: MapKey) -> Result<RuntimeToken, (Self, FirmwareStatus)> {
        let image = boot::image_handle().as_ptr();
        // SAFETY: nothing is allocated between the caller's map query and this call.
        let status = unsafe { (self.boot_services().exit_boot_services)(image, key.0) };
        let status = FirmwareStatus::from_raw(status.0);
        if status != FirmwareStatus::Success {
            return Err((self, status));
        }

        UefiLogger::exit_boot_services();
        boot_services_exited();

        // SAFETY: runtime services outlive boot services.
        let runtime = unsafe { self.system_table.as_ref() }.runtime_services;
        Ok(RuntimeToken {
            system_table: self.system_table,
            runtime,
        })
    }
}

/// What remains of the firmware after `ExitBootServices`.
pub struct RuntimeToken {
    system_table: NonNull<SystemTable>,
    runtime: *mut RawRuntimeServices,
}

impl RuntimeToken {
    fn runtime_services(&self) -> Option<&RawRuntimeServices> {
        // SAFETY: the firmware keeps the runtime table alive and mapped.
        unsafe { self.runtime.as_ref() }
    }
}

impl RuntimeServices for RuntimeToken {
    #[allow(clippy::cast_ptr_alignment)]
    fn set_virtual_address_map(
        &mut self,
        map_size: usize,
        stride: usize,
        version: u32,
        map: PhysicalAddress,
    ) -> FirmwareStatus {
        let Some(rt) = self.runtime_services() else {
            warn!("firmware has no runtime services table");
            return FirmwareStatus::Unsupported;
        };
        // SAFETY: `map` is identity-mapped and holds `map_size` bytes of descriptors.
        let status = unsafe {
            (rt.set_virtual_address_map)(map_size, stride, version, map.as_mut_ptr())
        };
        FirmwareStatus::from_raw(status.0)
    }

    fn convert_pointer(&mut self, pointer: &mut u64) -> FirmwareStatus {
        let Some(rt) = self.runtime_services() else {
            return FirmwareStatus::Unsupported;
        };
        let mut address = *pointer as *const c_void;
        // SAFETY: `address` is a valid out-parameter for the duration of the call.
        let status = unsafe { (rt.convert_pointer)(0, &raw mut address) };
        *pointer = address as u64;
        FirmwareStatus::from_raw(status.0)
    }
}

impl FirmwareRuntime for RuntimeToken {
    fn neutralize_handles(&mut self) {
        // SAFETY: boot services are gone; nobody else touches the table now.
        unsafe { neutralize_system_table(self.system_table.as_mut()) };
    }
}
