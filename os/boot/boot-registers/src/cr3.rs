use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use boot_addresses::PhysicalAddress;

/// CR3: Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical base address of the PML4 table and cache-control flags
/// for PML4 walks. Assumes standard 4 KiB alignment and no PCID (CR4.PCIDE = 0),
/// which is what UEFI firmware hands over.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2: Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3, PWT: Page-level Write-Through for PML4.
    pub pwt: bool,

    /// Bit 4, PCD: Page-level Cache Disable for PML4.
    pub pcd: bool,

    /// Bits 5–11: Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–51: PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52–63: Reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// Create a `Cr3` value from a PML4 physical base address and flags.
    ///
    /// `pml4_phys` must be 4 KiB-aligned.
    #[must_use]
    pub fn from_pml4_phys(pml4_phys: PhysicalAddress, pwt: bool, pcd: bool) -> Self {
        debug_assert_eq!(
            pml4_phys.as_u64() & 0xFFF,
            0,
            "PML4 base must be 4K-aligned"
        );
        Self::new()
            .with_pwt(pwt)
            .with_pcd(pcd)
            .with_pml4_base_4k(pml4_phys.as_u64() >> 12)
    }

    /// Return the full physical address of the PML4 base.
    #[must_use]
    pub const fn pml4_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.pml4_base_4k() << 12)
    }

    /// The PWT/PCD bits in their page-table-entry positions (bits 3 and 4).
    ///
    /// Newly allocated intermediate tables inherit these so that every level
    /// is walked with the same memory type as the root.
    #[must_use]
    pub const fn table_cache_bits(&self) -> u64 {
        self.into_bits() & 0x18
    }

    /// Same cache flags, different root.
    #[must_use]
    pub fn with_root(self, pml4_phys: PhysicalAddress) -> Self {
        Self::from_pml4_phys(pml4_phys, self.pwt(), self.pcd())
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
