//! # Page-Table Cloning
//!
//! Firmware leaves behind a page-table tree that maps far more than the kernel
//! handoff needs and often maps loader memory read-only or execute-disabled.
//! [`PageTableCloner`] produces a compacted copy that keeps only identity
//! mappings (VA == PA), loosens permissions on RAM and drops everything else.
//!
//! The traversal runs twice over the same tree: once with
//! [`CloneTarget::Measure`] to count the nodes the copy needs, then with
//! [`CloneTarget::Write`] into an allocation of exactly that many pages.
//!
//! ```text
//!  base            base+1·4K      base+2·4K       …
//!  ├── L4 copy ────┼── 1st child ─┼── its children ─┼── 2nd child ─ …
//! ```
//!
//! Each node is written at `base`, and its children are packed depth-first
//! right after it. A subtree that turns out empty is not linked in, and the
//! next sibling reuses its slot.

use crate::entry::{AddressMask, InheritedAttributes, Level, PageEntryBits};
use crate::node::PageTableNode;
use crate::PhysMapper;
use boot_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use boot_mmap::RamMap;
use log::trace;

/// Number of 4 KiB page-table nodes a (sub)tree occupies.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeCount(pub u64);

impl NodeCount {
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bytes the nodes occupy.
    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.0 * PAGE_SIZE
    }
}

/// What a traversal does with the nodes it visits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloneTarget {
    /// Count only.
    Measure,
    /// Write the copy starting at `base`; nothing may be written at or past `limit`.
    Write {
        base: PhysicalAddress,
        limit: PhysicalAddress,
    },
}

/// One step of a traversal: which table to read and what it covers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RelocationPlan {
    pub source_root: PhysicalAddress,
    pub level: Level,
    /// First virtual address the table covers.
    pub start: VirtualAddress,
    pub mask: AddressMask,
    pub inherited: InheritedAttributes,
}

impl RelocationPlan {
    /// Plan for a whole tree rooted at the level-4 table `root`.
    #[must_use]
    pub const fn for_root(root: PhysicalAddress, mask: AddressMask) -> Self {
        Self {
            source_root: root,
            level: Level::ROOT,
            start: VirtualAddress::zero(),
            mask,
            inherited: InheritedAttributes {
                read_only: false,
                no_execute: false,
            },
        }
    }
}

pub struct PageTableCloner<'a, M: PhysMapper> {
    mapper: &'a M,
    ram: RamMap<'a>,
}

impl<'a, M: PhysMapper> PageTableCloner<'a, M> {
    #[must_use]
    pub const fn new(mapper: &'a M, ram: RamMap<'a>) -> Self {
        Self { mapper, ram }
    }

    /// Nodes a copy of the tree described by `plan` needs.
    #[must_use]
    pub fn measure(&self, plan: RelocationPlan) -> NodeCount {
        self.clone_tree(plan, CloneTarget::Measure)
    }

    /// Measure or write a sanitized copy of the tree.
    ///
    /// Returns the number of nodes, or zero when the subtree holds no
    /// identity mapping worth keeping. A write that would cross `limit`
    /// also returns zero and leaves the parent slot unlinked.
    ///
    /// The source tree must not change between measuring and writing.
    #[must_use]
    pub fn clone_tree(&self, plan: RelocationPlan, target: CloneTarget) -> NodeCount {
        if let CloneTarget::Write { base, limit } = target
            && base.as_u64() + PAGE_SIZE > limit.as_u64()
        {
            trace!("clone write at {base:?} would cross {limit:?}");
            return NodeCount(0);
        }

        // SAFETY: `source_root` is either the live root or a table address
        // that passed the RAM check below; the mapper covers all RAM.
        let src: &PageTableNode = unsafe { self.mapper.phys_to_mut(plan.source_root) };
        let mut dst: Option<&mut PageTableNode> = match target {
            CloneTarget::Measure => None,
            CloneTarget::Write { base, .. } => {
                // SAFETY: `[base, base + 4K)` lies inside the caller's reservation.
                let node: &mut PageTableNode = unsafe { self.mapper.phys_to_mut(base) };
                node.zero();
                Some(node)
            }
        };

        let span = plan.level.entry_span();
        let mut count = 1u64;
        let mut kept = 0usize;

        for (index, raw) in src.present() {
            let va = canonical(plan.start.as_u64() + index as u64 * span);

            if plan.level.maps_leaf(raw) {
                let pa = plan.mask.leaf_address(raw, plan.level);
                if pa.as_u64() != va {
                    trace!("drop L{} leaf {va:#x} -> {pa:?}", plan.level.get());
                    continue;
                }
                let entry = self.sanitize_leaf(raw, pa, plan.inherited);
                if let Some(dst) = dst.as_deref_mut() {
                    dst.set(index, entry);
                }
                kept += 1;
                continue;
            }

            let Some(child_level) = plan.level.down() else {
                continue;
            };
            let table = plan.mask.table_address(raw);
            if !self.ram.is_usable_ram(table) {
                trace!("skip L{} entry {index}: table {table:?} is not RAM", plan.level.get());
                continue;
            }

            let child_plan = RelocationPlan {
                source_root: table,
                level: child_level,
                start: VirtualAddress::new(va),
                mask: plan.mask,
                inherited: plan
                    .inherited
                    .merge(InheritedAttributes::from_table_entry(raw)),
            };
            let child_target = match target {
                CloneTarget::Measure => CloneTarget::Measure,
                CloneTarget::Write { base, limit } => CloneTarget::Write {
                    base: base + count * PAGE_SIZE,
                    limit,
                },
            };

            let child = self.clone_tree(child_plan, child_target);
            if child.is_empty() {
                continue;
            }

            if let (Some(dst), CloneTarget::Write { base, .. }) = (dst.as_deref_mut(), child_target) {
                // Keep the flags and any encryption bit; restrictions now live in the leaves.
                let entry = PageEntryBits::from_bits(base.as_u64() | (raw & plan.mask.strip_bits()))
                    .with_writable(true)
                    .with_no_execute(false);
                dst.set(index, entry.into_bits());
            }
            count += child.0;
            kept += 1;
        }

        if kept == 0 {
            return NodeCount(0);
        }
        NodeCount(count)
    }

    fn sanitize_leaf(&self, raw: u64, pa: PhysicalAddress, inherited: InheritedAttributes) -> u64 {
        let entry = inherited.apply(raw);
        if self.ram.is_usable_ram(pa) {
            PageEntryBits::from_bits(entry)
                .with_writable(true)
                .with_no_execute(false)
                .into_bits()
        } else {
            entry
        }
    }
}

/// Sign-extend bit 47 so upper-half indices produce canonical addresses.
const fn canonical(va: u64) -> u64 {
    if va & (1 << 47) != 0 {
        va | 0xffff_0000_0000_0000
    } else {
        va
    }
}
