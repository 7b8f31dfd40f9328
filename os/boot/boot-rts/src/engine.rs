//! The runtime-services switch as a one-shot state machine.
//!
//! ```text
//! NotAttempted ─select─► Disabled(reason) | NoPolicyFits | PolicyChosen
//!                                                           │
//!                                                         apply
//!                                                           ▼
//!                                                  Applied | Failed
//! ```
//!
//! Only allocating the virtual map can fail the boot. Everything else degrades
//! to leaving runtime services at their physical addresses.

use crate::error::RtsError;
use crate::policy::RtsPolicy;
use crate::quirks::can_old_and_new;
use crate::window::{Capabilities, RtsWindow};
use boot_addresses::{PAGE_SIZE, PhysicalAddress, bytes_to_pages};
use boot_mmap::{DescriptorTable, FirmwareStatus, MemoryMapSnapshot};
use boot_quirks::QuirkBits;
use boot_vmem::{
    AllocationPool, BootAllocator, PageEntryBits, PageTableRoot, PageWalker, PhysMapper,
};
use log::{debug, info, warn};

/// The runtime half of the firmware, after boot services are gone.
pub trait RuntimeServices {
    /// `SetVirtualAddressMap` with the table at `map`.
    fn set_virtual_address_map(
        &mut self,
        map_size: usize,
        stride: usize,
        version: u32,
        map: PhysicalAddress,
    ) -> FirmwareStatus;

    /// `ConvertPointer` on `pointer`, allowing a null pointer.
    fn convert_pointer(&mut self, pointer: &mut u64) -> FirmwareStatus;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RtsConfig {
    /// Where the kernel wants runtime services; `None` leaves them alone.
    pub window: Option<RtsWindow>,
    pub no_rts: bool,
    /// Ignore platform quirks and skip the page-table quirks around the switch.
    pub no_quirks: bool,
    pub capabilities: Capabilities,
}

impl Default for RtsConfig {
    fn default() -> Self {
        Self {
            window: None,
            no_rts: false,
            no_quirks: false,
            capabilities: Capabilities::ALL_POLICIES,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DisableReason {
    NotRequested,
    DisabledByConfig,
    UnsupportedByPlatform,
    UnalignedWindow,
    /// `base + size` runs past the top of the address space.
    WindowOverflow,
    OldAndNewInfeasible,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RtsState {
    NotAttempted,
    Disabled(DisableReason),
    /// No layout fits; runtime services stay at physical addresses.
    NoPolicyFits,
    PolicyChosen {
        policy: RtsPolicy,
        map_size: usize,
    },
    Applied {
        policy: RtsPolicy,
    },
    /// The firmware rejected the new map.
    Failed {
        policy: RtsPolicy,
        status: FirmwareStatus,
    },
}

impl RtsState {
    /// Whether runtime services now live in the window.
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Page-table access for the switch.
pub struct RtsContext<'a, M: PhysMapper, A: BootAllocator + ?Sized> {
    pub(crate) mapper: &'a M,
    pub(crate) walker: PageWalker<'a, M>,
    pub(crate) alloc: &'a mut A,
    /// Flags for table entries created by the generic quirk.
    pub(crate) table_flags: u64,
}

impl<'a, M: PhysMapper, A: BootAllocator + ?Sized> RtsContext<'a, M, A> {
    #[must_use]
    pub fn new<R: PageTableRoot + ?Sized>(mapper: &'a M, root: &R, alloc: &'a mut A) -> Self {
        let table_flags = PageEntryBits::new()
            .with_present(true)
            .with_writable(true)
            .with_accessed(true)
            .into_bits()
            | root.table_cache_flags();
        Self {
            mapper,
            walker: PageWalker::new(mapper, root.current_root(), root.address_mask()),
            alloc,
            table_flags,
        }
    }

    #[must_use]
    pub const fn walker(&self) -> &PageWalker<'a, M> {
        &self.walker
    }
}

pub struct RtsEngine {
    config: RtsConfig,
    quirks: QuirkBits,
    caps: Capabilities,
    state: RtsState,
}

impl RtsEngine {
    #[must_use]
    pub const fn new(config: RtsConfig, quirks: QuirkBits) -> Self {
        Self {
            config,
            quirks,
            caps: config.capabilities,
            state: RtsState::NotAttempted,
        }
    }

    #[must_use]
    pub const fn state(&self) -> RtsState {
        self.state
    }

    /// Capabilities in effect, including the derived [`Capabilities::OLD_AND_NEW`].
    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Select and apply in one go.
    ///
    /// # Errors
    /// See [`apply`](Self::apply).
    pub fn run<R, M, A>(
        config: RtsConfig,
        quirks: QuirkBits,
        runtime: R,
        map: &mut MemoryMapSnapshot,
        ctx: &mut RtsContext<'_, M, A>,
    ) -> Result<RtsState, RtsError>
    where
        R: RuntimeServices,
        M: PhysMapper,
        A: BootAllocator + ?Sized,
    {
        Self::new(config, quirks).select(map, ctx).apply(runtime, map, ctx)
    }

    /// Decide whether and how runtime services get relocated.
    ///
    /// May clear stale top-level entries inside the window while probing for
    /// old-and-new support.
    #[must_use]
    pub fn select<M, A>(mut self, map: &MemoryMapSnapshot, ctx: &RtsContext<'_, M, A>) -> Self
    where
        M: PhysMapper,
        A: BootAllocator + ?Sized,
    {
        if self.state == RtsState::NotAttempted {
            self.state = self.decide(map, ctx);
            info!("runtime services: {:?}", self.state);
        }
        self
    }

    fn decide<M, A>(&mut self, map: &MemoryMapSnapshot, ctx: &RtsContext<'_, M, A>) -> RtsState
    where
        M: PhysMapper,
        A: BootAllocator + ?Sized,
    {
        let config = self.config;
        if config.no_rts {
            return RtsState::Disabled(DisableReason::DisabledByConfig);
        }
        if !config.no_quirks && self.quirks.contains(QuirkBits::RTS_UNSUPPORTED) {
            return RtsState::Disabled(DisableReason::UnsupportedByPlatform);
        }
        let Some(window) = config.window.filter(|w| !w.is_empty()) else {
            return RtsState::Disabled(DisableReason::NotRequested);
        };
        if !window.fits_address_space() {
            warn!(
                "runtime window {:?} + {:#x} wraps the address space",
                window.base(),
                window.size()
            );
            return RtsState::Disabled(DisableReason::WindowOverflow);
        }
        if !window.is_root_aligned() {
            warn!("runtime window {:?} is not 512 GiB aligned", window.base());
            return RtsState::Disabled(DisableReason::UnalignedWindow);
        }

        if !config.no_quirks {
            if can_old_and_new(map, window, ctx.walker()) {
                self.caps |= Capabilities::OLD_AND_NEW;
            } else if self.quirks.contains(QuirkBits::RTS_OLD_AND_NEW) {
                return RtsState::Disabled(DisableReason::OldAndNewInfeasible);
            }
        }
        debug!("runtime capabilities {:?}", self.caps);

        for &policy in RtsPolicy::ORDER {
            if !self.eligible(policy) {
                continue;
            }
            if let Some(map_size) = policy.supported(map, window) {
                return RtsState::PolicyChosen { policy, map_size };
            }
            debug!("{} layout does not fit", policy.name());
        }
        RtsState::NoPolicyFits
    }

    fn eligible(&self, policy: RtsPolicy) -> bool {
        let quirks_ok =
            self.config.no_quirks || !self.quirks.intersects(policy.incompatible_quirks());
        quirks_ok && self.caps.contains(policy.required_capabilities())
    }

    /// Build the virtual map, switch the firmware to it and consume `runtime`.
    ///
    /// Does nothing unless a policy was chosen. A firmware error from the switch
    /// is reported as [`RtsState::Failed`], not as an error.
    ///
    /// # Errors
    /// [`RtsError::OutOfResources`] if the virtual map cannot be allocated.
    pub fn apply<R, M, A>(
        self,
        mut runtime: R,
        map: &mut MemoryMapSnapshot,
        ctx: &mut RtsContext<'_, M, A>,
    ) -> Result<RtsState, RtsError>
    where
        R: RuntimeServices,
        M: PhysMapper,
        A: BootAllocator + ?Sized,
    {
        let RtsState::PolicyChosen { policy, map_size } = self.state else {
            return Ok(self.state);
        };
        let Some(window) = self.config.window else {
            return Ok(RtsState::Disabled(DisableReason::NotRequested));
        };

        let pages = bytes_to_pages(map_size as u64).max(1);
        let vmap_base = ctx
            .alloc
            .allocate_pages(pages, PAGE_SIZE, AllocationPool::Safe)
            .ok_or(RtsError::OutOfResources { bytes: map_size })?;
        // SAFETY: freshly allocated pages, identity-mapped while the loader runs.
        let bytes = unsafe { ctx.mapper.phys_to_bytes_mut(vmap_base, map_size) };
        bytes.fill(0);
        let mut vmap = DescriptorTable::new(bytes, map.stride());

        let count = policy.fill(map, window, &mut vmap);
        info!(
            "switching runtime services to {} layout: {count} regions at {:?}",
            policy.name(),
            window.base()
        );

        let quirks = !self.config.no_quirks;
        if quirks {
            policy.pre_quirk(ctx, window, self.caps, &vmap);
        }

        let status =
            runtime.set_virtual_address_map(map_size, map.stride(), map.version(), vmap_base);
        if status.is_error() {
            warn!("SetVirtualAddressMap failed: {status}");
        }

        if quirks {
            let smoke_test = Capabilities::RTS_DO_TEST | Capabilities::OLD_AND_NEW;
            if self.caps.contains(smoke_test) {
                let mut pointer = 0;
                let converted = runtime.convert_pointer(&mut pointer);
                debug!("ConvertPointer after the switch: {converted}");
            }
            policy.post_quirk(ctx, window, self.caps, &vmap);
        }
        drop(runtime);

        Ok(if status.is_error() {
            RtsState::Failed { policy, status }
        } else {
            RtsState::Applied { policy }
        })
    }
}
