//! The full sequence from live firmware to a kernel-ready machine.
//!
//! ```text
//!  boot services ──► phase-1 reserve ──► exit ──► phase-1 commit
//!                                                    │
//!  KernelHandoff ◄── normalize ◄── phase 2 ◄── runtime services switch
//! ```

use crate::config::HandoffConfig;
use crate::error::HandoffError;
use crate::exit::{BootServices, exit_boot_services};
use boot_addresses::PhysicalAddress;
use boot_mmap::{HANDOFF_RANGE_SIZE, HandoffRange, MemoryMapSnapshot, RamMap, get_memory_map};
use boot_quirks::QuirkBits;
use boot_rts::{RtsContext, RtsEngine, RtsState};
use boot_vmem::{BootAllocator, PageTableRoot, PhysMapper, TwoPhaseRelocator};
use log::{info, warn};

/// Everything the kernel gets from the loader.
#[derive(Debug)]
pub struct KernelHandoff {
    /// The final memory map, with virtual addresses filled in for runtime
    /// regions and normalized ranges in its extra region.
    pub memory_map: MemoryMapSnapshot,
    /// Root of the page tables in the safe pool.
    pub root: PhysicalAddress,
    pub rts: RtsState,
}

impl KernelHandoff {
    /// Whether runtime services were moved into the kernel's window.
    #[must_use]
    pub const fn rts_mapped(&self) -> bool {
        self.rts.is_mapped()
    }

    pub fn ranges(&self) -> impl Iterator<Item = HandoffRange> + '_ {
        self.memory_map.handoff_ranges()
    }
}

/// Exit boot services and prepare the machine for the kernel.
///
/// `root` is the live page-table root; it is switched twice. `alloc` must keep
/// serving both pools after boot services are gone.
///
/// # Errors
/// Resource exhaustion in any step, or a failed exit handshake. Runtime
/// services that cannot be relocated only degrade the result.
pub fn run_handoff<B, M, R, A>(
    mut boot: B,
    config: &HandoffConfig,
    quirks: QuirkBits,
    mapper: &M,
    root: &mut R,
    alloc: &mut A,
) -> Result<KernelHandoff, HandoffError>
where
    B: BootServices,
    M: PhysMapper,
    R: PageTableRoot + ?Sized,
    A: BootAllocator + ?Sized,
{
    if quirks.contains(QuirkBits::NET_DEV_DISABLE) {
        info!("disabling network controllers");
        boot.disable_network_controllers();
    }

    let relocator = TwoPhaseRelocator::new(mapper);
    let reservation = {
        let current = get_memory_map(&mut boot, 0)?;
        relocator.prepare(root, RamMap::new(&current), alloc)?
    };

    let (mut memory_map, runtime) = exit_boot_services(boot, HANDOFF_RANGE_SIZE)?;
    relocator.commit(reservation, root, RamMap::new(&memory_map))?;

    let rts = {
        let mut ctx = RtsContext::new(mapper, &*root, &mut *alloc);
        RtsEngine::run(config.rts(), quirks, runtime, &mut memory_map, &mut ctx)?
    };
    match rts {
        RtsState::Applied { policy } => info!("runtime services relocated ({})", policy.name()),
        RtsState::Failed { policy, status } => {
            warn!("runtime services stay physical: {} layout rejected with {status}", policy.name());
        }
        RtsState::Disabled(reason) => info!("runtime services not relocated: {reason:?}"),
        other => warn!("runtime services stay physical: {other:?}"),
    }

    let relocated = relocator.relocate_final(root, RamMap::new(&memory_map), alloc)?;
    let ranges = memory_map.emit_handoff_ranges(config.rts_requested())?;
    info!("handoff ready: {ranges} memory ranges, root {:?}", relocated.root);

    Ok(KernelHandoff {
        memory_map,
        root: relocated.root,
        rts,
    })
}
