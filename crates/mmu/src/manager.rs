//! The MMU core: address space lifecycle, mapping, translation and TLB upkeep.

use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

use crate::{
    Access, AddressSpace, Asid, CoreId, FaultCause, FrameAllocator, MemoryRegion, MmuError,
    PageDirectory, PageFault, PageFlags, PhysicalAddress, Platform, RootHandle, Tlb, TlbStats,
    Translation, VirtualAddress,
    stats::{MmuCounters, MmuStats},
};

/// Largest number of cores an [`Mmu`] tracks.
pub const MAX_CORES: usize = 64;

/// Sizing of an [`Mmu`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmuConfig {
    /// Number of cores, each with its own TLB.
    pub cores: usize,
    /// Slots per TLB.
    pub tlb_capacity: usize,
    /// Number of ASIDs, including the reserved ASID 0.
    pub asid_count: usize,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            cores: 1,
            tlb_capacity: 512,
            asid_count: 256,
        }
    }
}

struct CoreSlot {
    tlb: Mutex<Tlb>,
    active: Mutex<Option<Arc<AddressSpace>>>,
}

/// ASIDs are handed out from 1; ASID 0 is what the root register holds
/// before the first switch.
struct AsidPool {
    next: usize,
    limit: usize,
    free: Vec<Asid>,
}

impl AsidPool {
    fn alloc(&mut self) -> Option<Asid> {
        if let Some(asid) = self.free.pop() {
            return Some(asid);
        }
        if self.next >= self.limit {
            return None;
        }
        let asid = Asid::new(self.next as u16);
        self.next += 1;
        Some(asid)
    }

    fn free(&mut self, asid: Asid) {
        self.free.push(asid);
    }
}

/// The memory management unit of the whole machine.
///
/// Page table writes serialize on the per-space directory lock. Each core's
/// TLB has its own lock, always taken after the directory lock, so a mutation
/// and its shootdown complete before any core can refill a stale entry.
pub struct Mmu {
    config: MmuConfig,
    frames: Arc<dyn FrameAllocator>,
    platform: Arc<dyn Platform>,
    cores: Vec<CoreSlot>,
    asids: Mutex<AsidPool>,
    counters: MmuCounters,
}

impl Mmu {
    /// Creates an MMU core.
    ///
    /// # Panics
    ///
    /// Panics if the configuration asks for no cores, more than [`MAX_CORES`]
    /// cores, an empty TLB, or more ASIDs than fit in 16 bits.
    pub fn new(
        config: MmuConfig,
        frames: Arc<dyn FrameAllocator>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        assert!(
            (1..=MAX_CORES).contains(&config.cores),
            "core count must be between 1 and {}",
            MAX_CORES
        );
        assert!(config.asid_count <= 1 << 16, "ASIDs are 16 bits wide");
        let cores = (0..config.cores)
            .map(|_| CoreSlot {
                tlb: Mutex::new(Tlb::new(config.tlb_capacity)),
                active: Mutex::new(None),
            })
            .collect();
        Self {
            config,
            frames,
            platform,
            cores,
            asids: Mutex::new(AsidPool {
                next: 1,
                limit: config.asid_count,
                free: Vec::new(),
            }),
            counters: MmuCounters::default(),
        }
    }

    pub fn config(&self) -> MmuConfig {
        self.config
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Creates an empty address space with a fresh ASID and one owner.
    pub fn create_address_space(&self) -> Result<Arc<AddressSpace>, MmuError> {
        let asid = self.asids.lock().alloc().ok_or(MmuError::AsidExhausted)?;
        let directory = match PageDirectory::new(&*self.frames) {
            Ok(directory) => directory,
            Err(err) => {
                self.asids.lock().free(asid);
                return Err(err);
            }
        };
        let space = Arc::new(AddressSpace::new(asid, directory));
        MmuCounters::bump(&self.counters.spaces_created);
        log::debug!("created address space {} (root frame {})", asid, space.root());
        Ok(space)
    }

    /// Maps `[va, va + size)` onto `[pa, pa + size)` in `space`.
    pub fn map(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: usize,
        flags: PageFlags,
        overwrite: bool,
    ) -> Result<(), MmuError> {
        MmuCounters::bump(&self.counters.maps);
        let mut guard = space.directory.lock();
        let directory = guard.as_mut().ok_or(MmuError::Destroyed)?;
        let mut flushes = Vec::new();
        let result = directory.map(&*self.frames, va, pa, size, flags, overwrite, &mut flushes);
        self.shootdown(space.asid(), &flushes);
        result
    }

    /// Removes the translations for `[va, va + size)` from `space`.
    pub fn unmap(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        size: usize,
    ) -> Result<(), MmuError> {
        MmuCounters::bump(&self.counters.unmaps);
        let mut guard = space.directory.lock();
        let directory = guard.as_mut().ok_or(MmuError::Destroyed)?;
        let mut flushes = Vec::new();
        let result = directory.unmap(&*self.frames, va, size, &mut flushes);
        self.shootdown(space.asid(), &flushes);
        result
    }

    /// Replaces the permissions of every page in `[va, va + size)`.
    pub fn protect(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        size: usize,
        flags: PageFlags,
    ) -> Result<(), MmuError> {
        MmuCounters::bump(&self.counters.protects);
        let mut guard = space.directory.lock();
        let directory = guard.as_mut().ok_or(MmuError::Destroyed)?;
        let mut flushes = Vec::new();
        let result = directory.protect(&*self.frames, va, size, flags, &mut flushes);
        self.shootdown(space.asid(), &flushes);
        result
    }

    /// Walks the tables of `space` without touching any TLB.
    pub fn walk(&self, space: &AddressSpace, va: VirtualAddress) -> Option<Translation> {
        space.walk(va)
    }

    /// Translates `va` for `access` as `core` would.
    ///
    /// The core's TLB is consulted first. On a miss the tables are walked and a
    /// found leaf is cached, whether or not the access is then permitted. A
    /// destroyed space translates nothing, even if its ASID has been handed to
    /// a new space since.
    pub fn translate(
        &self,
        core: CoreId,
        space: &AddressSpace,
        va: VirtualAddress,
        access: Access,
    ) -> Result<Translation, PageFault> {
        MmuCounters::bump(&self.counters.translations);
        let fault = |cause| {
            MmuCounters::bump(&self.counters.page_faults);
            PageFault { va, access, cause }
        };
        if !va.is_canonical() {
            return Err(fault(FaultCause::Unsupported));
        }
        let Some(slot) = self.cores.get(core.index()) else {
            return Err(fault(FaultCause::Unsupported));
        };

        // The directory lock is held across the lookup so that destruction,
        // which recycles the ASID, cannot race with it.
        let guard = space.directory.lock();
        let Some(directory) = guard.as_ref() else {
            return Err(fault(FaultCause::NotPresent));
        };
        let cached = slot.tlb.lock().lookup(va, space.asid());
        let translation = match cached {
            Some(entry) => entry.translate(va),
            None => {
                let Some(translation) = directory.walk(va) else {
                    return Err(fault(FaultCause::NotPresent));
                };
                slot.tlb.lock().insert(
                    va,
                    space.asid(),
                    translation.base(),
                    translation.flags,
                    translation.granule,
                );
                translation
            }
        };
        drop(guard);

        if !access.is_permitted_by(translation.flags) {
            return Err(fault(FaultCause::PermissionViolation));
        }
        Ok(translation)
    }

    /// Installs `space` on `core`.
    ///
    /// The core's TLB keeps only entries of the new ASID; without ASID support
    /// in the platform it is flushed completely.
    pub fn switch_address_space(
        &self,
        core: CoreId,
        space: &Arc<AddressSpace>,
    ) -> Result<(), MmuError> {
        let slot = self.cores.get(core.index()).ok_or(MmuError::UnknownCore)?;
        let guard = space.directory.lock();
        if guard.is_none() {
            return Err(MmuError::Destroyed);
        }

        let mut active = slot.active.lock();
        if let Some(previous) = active.take() {
            previous.mark_inactive(core);
        }
        space.mark_active(core);
        *active = Some(space.clone());

        self.platform.write_active_root(RootHandle {
            frame: space.root(),
            asid: space.asid(),
        });
        let mut tlb = slot.tlb.lock();
        if self.platform.supports_asid() {
            tlb.retain_asid(space.asid());
        } else {
            tlb.invalidate_all(None);
            self.platform.invalidate_all(None);
        }
        self.platform.fence();
        MmuCounters::bump(&self.counters.switches);
        log::debug!("{} switched to address space {}", core, space.asid());
        Ok(())
    }

    /// Removes the active address space from `core`, returning it.
    pub fn deactivate(&self, core: CoreId) -> Result<Option<Arc<AddressSpace>>, MmuError> {
        let slot = self.cores.get(core.index()).ok_or(MmuError::UnknownCore)?;
        let previous = slot.active.lock().take();
        if let Some(space) = &previous {
            space.mark_inactive(core);
        }
        Ok(previous)
    }

    /// Returns the address space installed on `core`.
    pub fn active_space(&self, core: CoreId) -> Option<Arc<AddressSpace>> {
        self.cores.get(core.index())?.active.lock().clone()
    }

    /// Frees every table of `space`, invalidates its ASID everywhere and
    /// recycles the ASID.
    pub fn destroy_address_space(&self, space: &AddressSpace) -> Result<(), MmuError> {
        let mut guard = space.directory.lock();
        if space.is_active() {
            return Err(MmuError::InUse);
        }
        let directory = guard.take().ok_or(MmuError::Destroyed)?;

        let mut flushes = Vec::new();
        let freed = directory.destroy(&*self.frames, &mut flushes);
        for slot in &self.cores {
            slot.tlb.lock().invalidate_all(Some(space.asid()));
        }
        self.platform.invalidate_all(Some(space.asid()));
        self.platform.fence();
        drop(guard);

        self.asids.lock().free(space.asid());
        MmuCounters::bump(&self.counters.spaces_destroyed);
        log::debug!(
            "destroyed address space {} ({} nodes freed)",
            space.asid(),
            freed
        );
        Ok(())
    }

    /// Adds an owner to `space`.
    pub fn share(&self, space: &Arc<AddressSpace>) -> Arc<AddressSpace> {
        let owners = space.acquire();
        log::trace!("address space {} now has {} owners", space.asid(), owners);
        space.clone()
    }

    /// Drops one owner of `space`, destroying it when the last owner leaves.
    ///
    /// Returns true if the space was destroyed. If the last owner releases a
    /// space that is still active, the release is undone and `InUse` returned.
    pub fn release_address_space(&self, space: Arc<AddressSpace>) -> Result<bool, MmuError> {
        if space.release() > 0 {
            return Ok(false);
        }
        match self.destroy_address_space(&space) {
            Ok(()) => Ok(true),
            Err(MmuError::InUse) => {
                space.acquire();
                Err(MmuError::InUse)
            }
            Err(err) => Err(err),
        }
    }

    /// Identity-maps `region` into `space` with its mapping flags.
    ///
    /// Reserved regions are skipped.
    pub fn map_region(&self, space: &AddressSpace, region: &MemoryRegion) -> Result<(), MmuError> {
        let Some(flags) = region.mapping_flags() else {
            log::trace!("skipping reserved region at {}", region.base);
            return Ok(());
        };
        let va = VirtualAddress::from_raw(region.base.as_usize());
        self.map(space, va, region.base, region.size, flags, false)?;
        log::debug!(
            "mapped {} region {} ({} bytes) into {}",
            region.kind,
            region.base,
            region.size,
            space.asid()
        );
        Ok(())
    }

    /// Identity-maps every region in order, stopping at the first failure.
    pub fn map_regions<'a>(
        &self,
        space: &AddressSpace,
        regions: impl IntoIterator<Item = &'a MemoryRegion>,
    ) -> Result<(), MmuError> {
        regions
            .into_iter()
            .try_for_each(|region| self.map_region(space, region))
    }

    /// Drops the TLB entry covering `va` for `asid` on `core`, then the
    /// platform's cached translation, then fences.
    pub fn invalidate_tlb_entry(
        &self,
        core: CoreId,
        va: VirtualAddress,
        asid: Asid,
    ) -> Result<bool, MmuError> {
        let slot = self.cores.get(core.index()).ok_or(MmuError::UnknownCore)?;
        let removed = slot.tlb.lock().invalidate(va, asid);
        self.platform.invalidate_translation(va, Some(asid));
        self.platform.fence();
        Ok(removed)
    }

    /// Flushes the TLB of `core`, limited to `asid` if given.
    pub fn flush_tlb(&self, core: CoreId, asid: Option<Asid>) -> Result<(), MmuError> {
        let slot = self.cores.get(core.index()).ok_or(MmuError::UnknownCore)?;
        slot.tlb.lock().invalidate_all(asid);
        self.platform.invalidate_all(asid);
        self.platform.fence();
        Ok(())
    }

    /// Counters of the TLB of `core`.
    pub fn tlb_stats(&self, core: CoreId) -> Option<TlbStats> {
        Some(self.cores.get(core.index())?.tlb.lock().stats())
    }

    /// MMU-wide counters.
    pub fn stats(&self) -> MmuStats {
        self.counters.snapshot()
    }

    /// Zeroes the operation counters and every TLB's counters.
    pub fn reset_stats(&self) {
        self.counters.reset();
        for slot in &self.cores {
            slot.tlb.lock().reset_stats();
        }
    }

    /// Runs `f` with the TLB of `core` locked.
    pub fn with_tlb<R>(&self, core: CoreId, f: impl FnOnce(&mut Tlb) -> R) -> Option<R> {
        let slot = self.cores.get(core.index())?;
        Some(f(&mut slot.tlb.lock()))
    }

    /// Invalidates `pages` of `asid` in every core's TLB and in the platform,
    /// then fences. Must be called with the directory lock held.
    fn shootdown(&self, asid: Asid, pages: &[VirtualAddress]) {
        if !pages.is_empty() {
            for slot in &self.cores {
                let mut tlb = slot.tlb.lock();
                for &va in pages {
                    tlb.invalidate(va, asid);
                }
            }
            for &va in pages {
                self.platform.invalidate_translation(va, Some(asid));
            }
            MmuCounters::add(&self.counters.shootdowns, pages.len() as u64);
            log::trace!("shootdown of {} pages for {}", pages.len(), asid);
        }
        self.platform.fence();
    }
}
