//! System-table cleanup after `ExitBootServices`.
//!
//! The console handles and the boot-services pointer dangle once boot
//! services are gone, so they are nulled, and the header checksum is
//! recomputed over the modified table.

#![allow(unsafe_code)]

use core::ptr;
use uefi_raw::table::system::SystemTable;

/// Reflected CRC-32 (IEEE 802.3), as used by UEFI table headers.
fn crc32(bytes: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB8_8320;

    let mut crc = !0u32;
    for &byte in bytes {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (POLY & mask);
        }
    }
    !crc
}

/// Null every pointer into boot services and refresh `header.crc`.
///
/// # Safety
/// `st` must be the firmware's system table, `header.size` bytes long.
pub unsafe fn neutralize_system_table(st: &mut SystemTable) {
    st.stdin_handle = ptr::null_mut();
    st.stdin = ptr::null_mut();
    st.stdout_handle = ptr::null_mut();
    st.stdout = ptr::null_mut();
    st.stderr_handle = ptr::null_mut();
    st.stderr = ptr::null_mut();
    st.boot_services = ptr::null_mut();

    st.header.crc = 0;
    let len = st.header.size as usize;
    // SAFETY: the header covers the whole table, which the caller owns.
    let bytes = unsafe { core::slice::from_raw_parts(ptr::from_ref(st).cast::<u8>(), len) };
    let crc = crc32(bytes);
    st.header.crc = crc;
}
