//! AMD memory encryption discovery (CPUID `0x8000_001F`).
//!
//! Under SEV the guest marks encrypted pages with a "C-bit" inside the
//! physical-address field of every page-table entry. Walkers must strip it
//! before treating the field as an address.

/// Extended leaf reporting the maximum supported extended leaf.
const EXTENDED_MAX_LEAF: u32 = 0x8000_0000;

/// Encrypted memory capabilities leaf.
const MEMORY_ENCRYPTION_LEAF: u32 = 0x8000_001F;

/// `EAX[1]` of the encryption leaf: SEV supported.
const SEV_SUPPORTED: u32 = 1 << 1;

/// Decode the encryption-bit position from the raw leaf registers.
///
/// Returns `Some(bit)` when SEV is advertised; the position lives in `EBX[5:0]`.
#[must_use]
pub const fn encryption_bit_from_leaf(eax: u32, ebx: u32) -> Option<u8> {
    if eax & SEV_SUPPORTED == 0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    Some((ebx & 0x3F) as u8)
}

/// Query the CPU for the SEV encryption-bit position.
///
/// Must be called before boot services are torn down: SEV-ES guests can trap
/// on CPUID once the firmware's exception handlers are gone, so callers cache
/// the result.
#[cfg(target_arch = "x86_64")]
#[must_use]
pub fn memory_encryption_bit() -> Option<u8> {
    use core::arch::x86_64::__cpuid;

    #[allow(unused_unsafe)]
    let max = unsafe { __cpuid(EXTENDED_MAX_LEAF) }.eax;
    if max < MEMORY_ENCRYPTION_LEAF {
        return None;
    }

    #[allow(unused_unsafe)]
    let leaf = unsafe { __cpuid(MEMORY_ENCRYPTION_LEAF) };
    encryption_bit_from_leaf(leaf.eax, leaf.ebx)
}

#[cfg(not(target_arch = "x86_64"))]
#[must_use]
pub const fn memory_encryption_bit() -> Option<u8> {
    None
}
