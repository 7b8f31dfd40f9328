use bitfield_struct::bitfield;
use boot_addresses::{PAGE_SHIFT, PhysicalAddress, VirtualAddress};

/// Entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Attribute bits of any entry: the low 12 bits and execute-disable.
pub const ATTRIBUTE_BITS: u64 = (1 << 63) | 0xfff;

/// Bit 12 of a 2 MiB / 1 GiB leaf: the PAT selector, not an address bit.
pub const LARGE_PAT: u64 = 1 << 12;

/// A single x86-64 page-table entry in its raw bitfield form.
///
/// Models the superset of fields found in all four levels. Address bits are
/// deliberately not exposed here: where the frame address ends depends on the
/// level, the page size and (on SEV guests) the encryption bit, which is what
/// [`AddressMask`] handles.
///
/// | Bits  | Field               |
/// |-------|---------------------|
/// | 0     | `P` present         |
/// | 1     | `RW` writable       |
/// | 2     | `US` user           |
/// | 3     | `PWT` write-through |
/// | 4     | `PCD` cache disable |
/// | 5     | `A` accessed        |
/// | 6     | `D` dirty (leaf)    |
/// | 7     | `PS` / `PAT` at L1  |
/// | 8     | `G` global (leaf)   |
/// | 12–51 | frame               |
/// | 63    | `XD` execute-disable|
///
/// ### Example
/// ```rust
/// # use boot_vmem::PageEntryBits;
/// let e = PageEntryBits::from_bits(0x8000_0000_0010_0003);
/// assert!(e.present() && e.writable() && e.no_execute());
/// assert_eq!(e.with_writable(false).into_bits(), 0x8000_0000_0010_0001);
/// ```
#[bitfield(u64)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1). Clear for read-only.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5).
    pub accessed: bool,

    /// Dirty (D, bit 6), leaf only.
    pub dirty: bool,

    /// Page Size (PS, bit 7).
    ///
    /// At L3/L2 a set bit makes the entry a 1 GiB / 2 MiB leaf. At L1 the same
    /// position is the 4 KiB PAT selector.
    pub large_page: bool,

    /// Global (G, bit 8), leaf only.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Frame bits [51:12], read through [`AddressMask`].
    #[bits(40)]
    __: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection key (bits 59..=62).
    #[bits(4)]
    pub protection_key: u8,

    /// Execute-Disable (XD, bit 63).
    pub no_execute: bool,
}

/// Extracts physical addresses from raw entries.
///
/// The default strips [`ATTRIBUTE_BITS`]. On AMD SEV guests the memory
/// encryption bit (the "C-bit") sits inside the address field of every entry
/// and has to be stripped as well, or table addresses point into nowhere.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressMask {
    strip: u64,
}

impl Default for AddressMask {
    fn default() -> Self {
        Self::standard()
    }
}

impl AddressMask {
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            strip: ATTRIBUTE_BITS,
        }
    }

    /// Mask for a guest whose memory encryption bit is at position `bit`.
    ///
    /// ```rust
    /// # use boot_vmem::{AddressMask, ATTRIBUTE_BITS};
    /// assert_eq!(AddressMask::with_encryption_bit(Some(51)).strip_bits(), ATTRIBUTE_BITS | 1 << 51);
    /// assert_eq!(AddressMask::with_encryption_bit(None), AddressMask::standard());
    /// ```
    #[must_use]
    pub const fn with_encryption_bit(bit: Option<u8>) -> Self {
        match bit {
            Some(bit) if bit < 64 => Self {
                strip: ATTRIBUTE_BITS | (1 << bit),
            },
            _ => Self::standard(),
        }
    }

    /// Every bit that is not part of a table or 4 KiB frame address.
    #[must_use]
    pub const fn strip_bits(self) -> u64 {
        self.strip
    }

    /// Address of the next-level table an entry points to.
    #[must_use]
    pub const fn table_address(self, raw: u64) -> PhysicalAddress {
        PhysicalAddress::new(raw & !self.strip)
    }

    /// Frame address of a leaf at `level`.
    #[must_use]
    pub const fn leaf_address(self, raw: u64, level: Level) -> PhysicalAddress {
        if level.get() > 1 {
            PhysicalAddress::new(raw & !(self.strip | LARGE_PAT))
        } else {
            PhysicalAddress::new(raw & !self.strip)
        }
    }
}

/// Paging level, 4 (root) down to 1 (4 KiB leaves).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Level(u8);

impl Level {
    pub const ROOT: Self = Self(4);
    pub const PAGE_TABLE: Self = Self(1);

    #[must_use]
    pub const fn new(level: u8) -> Option<Self> {
        match level {
            1..=4 => Some(Self(level)),
            _ => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Bytes of virtual address space one entry at this level covers.
    ///
    /// ```rust
    /// # use boot_vmem::Level;
    /// assert_eq!(Level::PAGE_TABLE.entry_span(), 4096);
    /// assert_eq!(Level::ROOT.entry_span(), 512 << 30);
    /// ```
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    const fn shift(self) -> u32 {
        match self.0 {
            1 => PAGE_SHIFT,
            2 => PAGE_SHIFT + 9,
            3 => PAGE_SHIFT + 18,
            _ => PAGE_SHIFT + 27,
        }
    }

    /// The next level towards the leaves.
    #[must_use]
    pub const fn down(self) -> Option<Self> {
        match self.0 {
            2..=4 => Some(Self(self.0 - 1)),
            _ => None,
        }
    }

    /// Whether a present `raw` entry at this level maps memory rather than
    /// pointing to a table.
    #[must_use]
    pub const fn maps_leaf(self, raw: u64) -> bool {
        self.0 == 1 || (self.0 <= 3 && PageEntryBits::from_bits(raw).large_page())
    }

    /// Table index `va` selects at this level.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1ff) as usize
    }
}

/// Restrictions accumulated from the table entries above a leaf.
///
/// The CPU intersects permissions over the walk, so a read-only or
/// execute-disabled table entry restricts everything beneath it. A clone that
/// loosens table entries has to push those restrictions down into the leaves.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct InheritedAttributes {
    pub read_only: bool,
    pub no_execute: bool,
}

impl InheritedAttributes {
    /// Restrictions a table entry imposes on its subtree.
    #[must_use]
    pub const fn from_table_entry(raw: u64) -> Self {
        let bits = PageEntryBits::from_bits(raw);
        Self {
            read_only: !bits.writable(),
            no_execute: bits.no_execute(),
        }
    }

    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            read_only: self.read_only || other.read_only,
            no_execute: self.no_execute || other.no_execute,
        }
    }

    /// Apply the restrictions to a leaf entry.
    #[must_use]
    pub const fn apply(self, raw: u64) -> u64 {
        let mut bits = PageEntryBits::from_bits(raw);
        if self.read_only {
            bits = bits.with_writable(false);
        }
        if self.no_execute {
            bits = bits.with_no_execute(true);
        }
        bits.into_bits()
    }
}

/// Attribute bits of a leaf, in 4 KiB format.
///
/// Large leaves keep PAT in bit 12 and PS in bit 7; a 4 KiB entry has no PS
/// and keeps PAT in bit 7.
///
/// ```rust
/// # use boot_vmem::{Level, small_leaf_flags};
/// // 2 MiB, present, writable, PAT
/// assert_eq!(small_leaf_flags(0x20_1083, Level::new(2).unwrap()), 0x83);
/// assert_eq!(small_leaf_flags(0x20_0083, Level::new(2).unwrap()), 0x03);
/// assert_eq!(small_leaf_flags(0x8000_0000_0010_0063, Level::PAGE_TABLE), 0x8000_0000_0000_0063);
/// ```
#[must_use]
pub const fn small_leaf_flags(raw: u64, level: Level) -> u64 {
    if level.get() == 1 {
        return raw & ATTRIBUTE_BITS;
    }
    let mut flags = raw & (ATTRIBUTE_BITS | LARGE_PAT);
    flags = PageEntryBits::from_bits(flags).with_large_page(false).into_bits();
    if flags & LARGE_PAT != 0 {
        flags = PageEntryBits::from_bits(flags & !LARGE_PAT)
            .with_large_page(true)
            .into_bits();
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_leaf_address_drops_pat() {
        let mask = AddressMask::standard();
        let raw = 0x20_0000 | LARGE_PAT | 0x83;
        assert_eq!(mask.leaf_address(raw, Level::new(2).unwrap()).as_u64(), 0x20_0000);
        assert_eq!(mask.table_address(0x3000 | 0x23).as_u64(), 0x3000);
    }

    #[test]
    fn encryption_bit_is_stripped_from_addresses() {
        let mask = AddressMask::with_encryption_bit(Some(47));
        let raw = (1 << 47) | 0x4000 | 0x3;
        assert_eq!(mask.table_address(raw).as_u64(), 0x4000);
        assert_eq!(AddressMask::standard().table_address(raw).as_u64(), (1 << 47) | 0x4000);
        assert_eq!(raw & mask.strip_bits(), (1 << 47) | 0x3);
    }

    #[test]
    fn leaf_detection_per_level() {
        let ps = 1 << 7;
        assert!(Level::PAGE_TABLE.maps_leaf(0x1000));
        assert!(Level::new(2).unwrap().maps_leaf(ps | 1));
        assert!(Level::new(3).unwrap().maps_leaf(ps | 1));
        assert!(!Level::new(3).unwrap().maps_leaf(1));
        assert!(!Level::ROOT.maps_leaf(ps | 1));
    }

    #[test]
    fn index_and_descend() {
        let va = VirtualAddress::new(0xffff_ff80_0020_1000);
        assert_eq!(Level::ROOT.index_of(va), 511);
        assert_eq!(Level::new(2).unwrap().index_of(va), 1);
        assert_eq!(Level::PAGE_TABLE.index_of(va), 1);
        assert_eq!(Level::new(2).unwrap().down(), Some(Level::PAGE_TABLE));
        assert_eq!(Level::PAGE_TABLE.down(), None);
    }

    #[test]
    fn inherited_restrictions_accumulate() {
        let ro = InheritedAttributes::from_table_entry(0x1);
        let nx = InheritedAttributes::from_table_entry(0x8000_0000_0000_0003);
        let both = ro.merge(nx);
        assert!(both.read_only && both.no_execute);
        assert_eq!(both.apply(0x5003), 0x8000_0000_0000_5001);
        assert_eq!(InheritedAttributes::default().apply(0x5003), 0x5003);
    }
}
