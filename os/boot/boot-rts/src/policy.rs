//! Virtual layouts for runtime-services regions.
//!
//! A policy decides where each runtime region lands inside the window. All
//! policies walk the map in firmware order and only look at descriptors with
//! the runtime attribute.

use crate::engine::RtsContext;
use crate::quirks;
use crate::window::{Capabilities, RtsWindow};
use boot_addresses::VirtualAddress;
use boot_mmap::{DescriptorTable, Descriptors, MemoryDescriptor, MemoryMapSnapshot};
use boot_quirks::QuirkBits;
use boot_vmem::{BootAllocator, PhysMapper};
use core::iter::Enumerate;
use log::{debug, trace};

/// Physical distance below which compact layout keeps the gap between two
/// neighboring runtime images.
const COMPACT_GAP_LIMIT: u64 = 0xffff_ffff;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RtsPolicy {
    /// `VA = window + PA`, with the identity slots mirrored into the window
    /// for the duration of the switch.
    Simple,
    /// Same layout as [`Simple`](Self::Simple), with per-page mappings instead
    /// of mirrored top-level slots.
    SimpleGenericQuirk,
    /// `VA = window + PA - lowest runtime PA`.
    Sparse,
    /// Packed in firmware order; gaps between neighboring runtime images are
    /// kept.
    Compact,
    /// Packed in firmware order without gaps.
    Contiguous,
}

impl RtsPolicy {
    /// Trial order, most faithful layout first.
    pub const ORDER: &'static [Self] = &[
        Self::Simple,
        Self::SimpleGenericQuirk,
        Self::Sparse,
        Self::Compact,
        Self::Contiguous,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Simple => "simple offset",
            Self::SimpleGenericQuirk => "simple offset with generic quirks",
            Self::Sparse => "sparse",
            Self::Compact => "compact",
            Self::Contiguous => "contiguous",
        }
    }

    /// Platform quirks under which the layout must not be used.
    #[must_use]
    pub const fn incompatible_quirks(self) -> QuirkBits {
        match self {
            Self::Simple | Self::SimpleGenericQuirk => QuirkBits::empty(),
            Self::Sparse | Self::Compact | Self::Contiguous => QuirkBits::RTS_UNKNOWN_MEM,
        }
    }

    #[must_use]
    pub const fn required_capabilities(self) -> Capabilities {
        match self {
            Self::Simple => Capabilities::SIMPLE,
            Self::SimpleGenericQuirk => Capabilities::SIMPLE_GQ,
            Self::Sparse => Capabilities::SPARSE,
            Self::Compact => Capabilities::COMPACT,
            Self::Contiguous => Capabilities::CONTIG,
        }
    }

    /// Size in bytes of the virtual map this layout needs, or `None` if some
    /// runtime region would end outside the window.
    #[must_use]
    pub fn supported(self, map: &MemoryMapSnapshot, window: RtsWindow) -> Option<usize> {
        let mut count = 0usize;
        for placement in self.placements(map) {
            let end = placement.offset.checked_add(placement.desc.size())?;
            let last = window.base().as_u64().checked_add(end.saturating_sub(1));
            if end > window.size() || last.is_none() {
                trace!(
                    "{}: {:?} ends {end:#x} past window size {:#x}",
                    self.name(),
                    placement.desc,
                    window.size()
                );
                return None;
            }
            count += 1;
        }
        count.checked_mul(map.stride())
    }

    /// Copy every runtime descriptor into `out` with its new virtual start,
    /// and record the same virtual start in `map`.
    ///
    /// Returns the number of descriptors written.
    pub fn fill(
        self,
        map: &mut MemoryMapSnapshot,
        window: RtsWindow,
        out: &mut DescriptorTable<'_>,
    ) -> usize {
        let stride = map.stride();
        let mut written = 0;
        for placement in self.placements(map) {
            let start = placement.index * stride;
            let Some(raw) = map.map_bytes().get(start..start + stride) else {
                break;
            };
            let Some(va) = window.base().as_u64().checked_add(placement.offset) else {
                break;
            };
            let va = VirtualAddress::new(va);
            if !out.copy_raw_entry(written, raw) || !out.set_virtual_start(written, va) {
                break;
            }
            trace!("{:?} -> {va:?}", placement.desc.physical_start);
            written += 1;
        }

        let mut next = 0;
        for index in 0..map.len() {
            if !map.get(index).is_some_and(|d| d.is_runtime()) {
                continue;
            }
            if next == written {
                break;
            }
            if let Some(desc) = out.get(next) {
                map.set_virtual_start(index, desc.virtual_start);
            }
            next += 1;
        }
        debug!("{}: assigned {written} runtime regions", self.name());
        written
    }

    /// Prepare the page tables so firmware survives the address switch.
    ///
    /// Does nothing unless old-and-new mappings are possible.
    pub fn pre_quirk<M, A>(
        self,
        ctx: &mut RtsContext<'_, M, A>,
        window: RtsWindow,
        caps: Capabilities,
        vmap: &DescriptorTable<'_>,
    ) where
        M: PhysMapper,
        A: BootAllocator + ?Sized,
    {
        if !caps.contains(Capabilities::OLD_AND_NEW) {
            return;
        }
        match self {
            Self::Simple => quirks::mirror_identity_slots(ctx.walker(), window),
            _ => quirks::map_virtual_ranges(ctx, vmap),
        }
    }

    /// Undo [`pre_quirk`](Self::pre_quirk).
    pub fn post_quirk<M, A>(
        self,
        ctx: &mut RtsContext<'_, M, A>,
        window: RtsWindow,
        caps: Capabilities,
        vmap: &DescriptorTable<'_>,
    ) where
        M: PhysMapper,
        A: BootAllocator + ?Sized,
    {
        if !caps.contains(Capabilities::OLD_AND_NEW) {
            return;
        }
        match self {
            Self::Simple => quirks::clear_mirrored_slots(ctx.walker(), window),
            _ => quirks::unmap_virtual_ranges(ctx.walker(), vmap),
        }
    }

    fn placements(self, map: &MemoryMapSnapshot) -> Placements<'_> {
        let min_pa = map
            .iter()
            .filter(MemoryDescriptor::is_runtime)
            .map(|d| d.physical_start.as_u64())
            .min()
            .unwrap_or(0);
        Placements {
            policy: self,
            descriptors: map.iter().enumerate(),
            min_pa,
            next: 0,
            prev: None,
        }
    }
}

/// A runtime region and its offset from the window base.
struct Placement {
    index: usize,
    desc: MemoryDescriptor,
    offset: u64,
}

struct Placements<'a> {
    policy: RtsPolicy,
    descriptors: Enumerate<Descriptors<'a>>,
    min_pa: u64,
    next: u64,
    prev: Option<MemoryDescriptor>,
}

impl Iterator for Placements<'_> {
    type Item = Placement;

    fn next(&mut self) -> Option<Placement> {
        let (index, desc) = self.descriptors.find(|(_, d)| d.is_runtime())?;
        let pa = desc.physical_start.as_u64();
        let offset = match self.policy {
            RtsPolicy::Simple | RtsPolicy::SimpleGenericQuirk => pa,
            RtsPolicy::Sparse => pa - self.min_pa,
            RtsPolicy::Compact => {
                let gap = self.prev.map_or(0, |prev| compact_gap(&prev, &desc));
                self.next.saturating_add(gap)
            }
            RtsPolicy::Contiguous => self.next,
        };
        self.next = offset.saturating_add(desc.size());
        self.prev = Some(desc);
        Some(Placement {
            index,
            desc,
            offset,
        })
    }
}

/// Bytes between two runtime images that compact layout preserves.
fn compact_gap(prev: &MemoryDescriptor, cur: &MemoryDescriptor) -> u64 {
    let prev_pa = prev.physical_start.as_u64();
    let prev_end = prev.physical_end().as_u64();
    let pa = cur.physical_start.as_u64();
    let both_images = prev.ty.is_runtime_image() && cur.ty.is_runtime_image();
    if both_images && pa >= prev_end && pa - prev_pa < COMPACT_GAP_LIMIT {
        pa - prev_end
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boot_addresses::{PhysicalAddress, VirtualAddress};
    use boot_mmap::{MemoryAttribute, MemoryType};

    const STRIDE: usize = 48;
    const WINDOW_BASE: u64 = 0xffff_ff00_0000_0000;

    fn runtime(ty: MemoryType, pa: u64, pages: u64) -> MemoryDescriptor {
        MemoryDescriptor::new(
            ty,
            PhysicalAddress::new(pa),
            pages,
            MemoryAttribute::RUNTIME.union(MemoryAttribute::WRITE_BACK),
        )
    }

    fn snapshot(descs: &[MemoryDescriptor]) -> MemoryMapSnapshot {
        MemoryMapSnapshot::from_descriptors(descs, STRIDE, 1, 0).unwrap()
    }

    fn window(size: u64) -> RtsWindow {
        RtsWindow::new(VirtualAddress::new(WINDOW_BASE), size)
    }

    fn offsets(policy: RtsPolicy, map: &MemoryMapSnapshot) -> Vec<u64> {
        policy.placements(map).map(|p| p.offset).collect()
    }

    fn sample() -> MemoryMapSnapshot {
        snapshot(&[
            MemoryDescriptor::new(
                MemoryType::CONVENTIONAL,
                PhysicalAddress::zero(),
                0x100,
                MemoryAttribute::WRITE_BACK,
            ),
            runtime(MemoryType::RUNTIME_SERVICES_CODE, 0x7f00_0000, 4),
            runtime(MemoryType::RUNTIME_SERVICES_DATA, 0x7f00_8000, 2),
            runtime(MemoryType::MMIO, 0xfec0_0000, 1),
            runtime(MemoryType::RUNTIME_SERVICES_DATA, 0x7f10_0000, 1),
        ])
    }

    #[test]
    fn layouts_of_the_sample_map() {
        let map = sample();
        assert_eq!(
            offsets(RtsPolicy::Simple, &map),
            [0x7f00_0000, 0x7f00_8000, 0xfec0_0000, 0x7f10_0000]
        );
        assert_eq!(
            offsets(RtsPolicy::Sparse, &map),
            [0, 0x8000, 0x7fc0_0000, 0x10_0000]
        );
        // Code→data keeps its 16 KiB gap; MMIO and what follows it are packed.
        assert_eq!(
            offsets(RtsPolicy::Compact, &map),
            [0, 0x8000, 0xa000, 0xb000]
        );
        assert_eq!(
            offsets(RtsPolicy::Contiguous, &map),
            [0, 0x4000, 0x6000, 0x7000]
        );
    }

    #[test]
    fn compact_ignores_descending_neighbors() {
        let map = snapshot(&[
            runtime(MemoryType::RUNTIME_SERVICES_CODE, 0x9000_0000, 1),
            runtime(MemoryType::RUNTIME_SERVICES_DATA, 0x8000_0000, 1),
            runtime(MemoryType::RUNTIME_SERVICES_DATA, 0x1_8000_2000, 1),
        ]);
        // Descending, then more than 4 GiB apart: no gaps either time.
        assert_eq!(offsets(RtsPolicy::Compact, &map), [0, 0x1000, 0x2000]);
    }

    #[test]
    fn supported_checks_the_window_size() {
        let map = sample();
        assert_eq!(RtsPolicy::Simple.supported(&map, window(4 << 30)), Some(4 * STRIDE));
        assert_eq!(RtsPolicy::Simple.supported(&map, window(0xfec0_0000)), None);
        assert_eq!(RtsPolicy::Sparse.supported(&map, window(0x7fc0_1000)), Some(4 * STRIDE));
        assert_eq!(RtsPolicy::Sparse.supported(&map, window(0x7fc0_0fff)), None);
        assert_eq!(RtsPolicy::Contiguous.supported(&map, window(0x8000)), Some(4 * STRIDE));
        assert_eq!(RtsPolicy::Contiguous.supported(&map, window(0x7fff)), None);
    }

    #[test]
    fn fill_writes_both_tables() {
        let mut map = sample();
        let mut bytes = vec![0u8; 4 * STRIDE];
        let mut out = DescriptorTable::new(&mut bytes, STRIDE);

        let written = RtsPolicy::Contiguous.fill(&mut map, window(1 << 30), &mut out);
        assert_eq!(written, 4);

        let expected = [0, 0x4000, 0x6000, 0x7000].map(|o| VirtualAddress::new(WINDOW_BASE + o));
        let out_vas: Vec<_> = out.iter().map(|d| d.virtual_start).collect();
        assert_eq!(out_vas, expected);
        assert_eq!(out.get(2).unwrap().ty, MemoryType::MMIO);

        let map_vas: Vec<_> = map
            .iter()
            .filter(MemoryDescriptor::is_runtime)
            .map(|d| d.virtual_start)
            .collect();
        assert_eq!(map_vas, expected);
        assert_eq!(map.get(0).unwrap().virtual_start, VirtualAddress::zero());
    }

    #[test]
    fn placements_past_the_top_of_the_address_space_are_rejected() {
        // 1 TiB window starting 512 GiB below the top: its upper half wraps.
        let window = RtsWindow::new(VirtualAddress::new(0xffff_ff80_0000_0000), 1 << 40);
        let mut map = snapshot(&[
            runtime(MemoryType::RUNTIME_SERVICES_CODE, 0x1000, 1),
            runtime(MemoryType::RUNTIME_SERVICES_DATA, 0x80_0000_0000, 1),
        ]);
        assert_eq!(RtsPolicy::Simple.supported(&map, window), None);

        let mut bytes = vec![0u8; 2 * STRIDE];
        let mut out = DescriptorTable::new(&mut bytes, STRIDE);
        let written = RtsPolicy::Simple.fill(&mut map, window, &mut out);
        assert_eq!(written, 1);
        assert_eq!(
            out.get(0).unwrap().virtual_start,
            VirtualAddress::new(0xffff_ff80_0000_1000)
        );
        assert_eq!(out.get(1).unwrap().virtual_start, VirtualAddress::zero());
        assert_eq!(map.get(1).unwrap().virtual_start, VirtualAddress::zero());
    }

    #[test]
    fn order_and_tables() {
        assert_eq!(RtsPolicy::ORDER.first(), Some(&RtsPolicy::Simple));
        assert_eq!(RtsPolicy::ORDER.last(), Some(&RtsPolicy::Contiguous));
        for policy in RtsPolicy::ORDER {
            assert_eq!(policy.required_capabilities().bits().count_ones(), 1);
            assert!(Capabilities::ALL_POLICIES.contains(policy.required_capabilities()));
        }
        assert!(RtsPolicy::SimpleGenericQuirk.incompatible_quirks().is_empty());
        assert_eq!(RtsPolicy::Compact.incompatible_quirks(), QuirkBits::RTS_UNKNOWN_MEM);
    }
}
