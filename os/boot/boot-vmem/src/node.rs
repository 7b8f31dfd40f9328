use crate::entry::{ENTRIES_PER_TABLE, PageEntryBits};

/// One 4 KiB page-table page: 512 raw entries at any level.
#[repr(C, align(4096))]
pub struct PageTableNode {
    entries: [u64; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTableNode>() == 4096);

impl PageTableNode {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [0; ENTRIES_PER_TABLE],
        }
    }

    /// Raw entry at `index`.
    ///
    /// # Panics
    /// If `index >= 512`.
    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> u64 {
        self.entries[index]
    }

    #[inline]
    #[must_use]
    pub const fn bits(&self, index: usize) -> PageEntryBits {
        PageEntryBits::from_bits(self.entries[index])
    }

    #[inline]
    pub const fn set(&mut self, index: usize, raw: u64) {
        self.entries[index] = raw;
    }

    #[inline]
    pub const fn clear(&mut self, index: usize) {
        self.entries[index] = 0;
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(0);
    }

    /// Present entries with their indices.
    pub fn present(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, raw)| PageEntryBits::from_bits(raw).present())
    }
}
