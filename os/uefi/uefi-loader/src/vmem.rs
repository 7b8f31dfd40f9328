//! The live address space as the handoff sees it: the firmware's identity map
//! and the CR3 register.

use boot_addresses::PhysicalAddress;
use boot_registers::cpuid::memory_encryption_bit;
use boot_registers::cr3::Cr3;
use boot_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use boot_vmem::{AddressMask, PageTableRoot, PhysMapper};
use log::debug;

/// UEFI identity-maps all memory, so a physical address is a pointer.
pub struct IdentityMapper;

impl PhysMapper for IdentityMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *pa.as_mut_ptr::<T>() }
    }
}

/// CR3, plus the address mask its entries have to be read with.
pub struct Cr3Root {
    cr3: Cr3,
    mask: AddressMask,
}

impl Cr3Root {
    /// Capture the firmware's CR3. Must run before boot services exit, since
    /// the SEV check executes CPUID.
    pub fn current() -> Self {
        let bit = memory_encryption_bit();
        if let Some(bit) = bit {
            debug!("memory encryption bit {bit} is stripped from page-table addresses");
        }
        // SAFETY: the loader runs in ring 0.
        let cr3 = unsafe { Cr3::load_unsafe() };
        Self {
            cr3,
            mask: AddressMask::with_encryption_bit(bit),
        }
    }
}

impl PageTableRoot for Cr3Root {
    fn current_root(&self) -> PhysicalAddress {
        self.mask.table_address(self.cr3.into_bits())
    }

    unsafe fn install_root(&mut self, root: PhysicalAddress) {
        let next = self.cr3.with_root(root);
        unsafe { next.store_unsafe() };
        self.cr3 = next;
    }

    fn address_mask(&self) -> AddressMask {
        self.mask
    }

    fn table_cache_flags(&self) -> u64 {
        self.cr3.table_cache_bits()
    }
}
