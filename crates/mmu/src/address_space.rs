//! Address space management.
//!
//! An address space pairs a page table tree with the ASID that tags its TLB
//! entries. It is shared between owners through `Arc` and an explicit owner
//! count maintained by [`Mmu::share`](crate::Mmu::share) and
//! [`Mmu::release_address_space`](crate::Mmu::release_address_space).

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{Asid, CoreId, FrameNumber, MAX_CORES, PageDirectory, Translation, VirtualAddress};

/// A virtual address space.
pub struct AddressSpace {
    asid: Asid,
    root: FrameNumber,
    /// `None` once the space has been destroyed.
    pub(crate) directory: Mutex<Option<PageDirectory>>,
    owners: AtomicUsize,
    /// Bit `n` is set while the space is installed on core `n`.
    active_on: AtomicU64,
}

impl AddressSpace {
    pub(crate) fn new(asid: Asid, directory: PageDirectory) -> Self {
        Self {
            asid,
            root: directory.root(),
            directory: Mutex::new(Some(directory)),
            owners: AtomicUsize::new(1),
            active_on: AtomicU64::new(0),
        }
    }

    /// Returns the ASID tagging this space's TLB entries.
    pub fn asid(&self) -> Asid {
        self.asid
    }

    /// Returns the frame backing the root table.
    pub fn root(&self) -> FrameNumber {
        self.root
    }

    /// Returns the number of owners.
    pub fn owners(&self) -> usize {
        self.owners.load(Ordering::Acquire)
    }

    /// Returns true if the space is installed on any core.
    pub fn is_active(&self) -> bool {
        self.active_on.load(Ordering::Acquire) != 0
    }

    /// Returns true if the space is installed on `core`.
    pub fn is_active_on(&self, core: CoreId) -> bool {
        self.active_on.load(Ordering::Acquire) & core_bit(core) != 0
    }

    /// Returns true once the space's tables have been freed.
    pub fn is_destroyed(&self) -> bool {
        self.directory.lock().is_none()
    }

    /// Returns the number of page table nodes, or zero once destroyed.
    pub fn node_count(&self) -> usize {
        self.directory.lock().as_ref().map_or(0, PageDirectory::node_count)
    }

    /// Walks the tables without consulting any TLB.
    pub fn walk(&self, va: VirtualAddress) -> Option<Translation> {
        self.directory.lock().as_ref()?.walk(va)
    }

    pub(crate) fn mark_active(&self, core: CoreId) {
        self.active_on.fetch_or(core_bit(core), Ordering::AcqRel);
    }

    pub(crate) fn mark_inactive(&self, core: CoreId) {
        self.active_on.fetch_and(!core_bit(core), Ordering::AcqRel);
    }

    pub(crate) fn acquire(&self) -> usize {
        self.owners.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one owner and returns how many remain.
    pub(crate) fn release(&self) -> usize {
        let previous = self
            .owners
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |owners| owners.checked_sub(1))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

/// Returns the `active_on` bit of `core`, or no bits for a core the MMU
/// cannot have.
fn core_bit(core: CoreId) -> u64 {
    if core.index() < MAX_CORES { 1 << core.index() } else { 0 }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("asid", &self.asid)
            .field("root", &self.root)
            .field("owners", &self.owners())
            .field("active_on", &self.active_on.load(Ordering::Relaxed))
            .finish()
    }
}
