//! MMU-wide counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time copy of the [`Mmu`](crate::Mmu) counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MmuStats {
    pub spaces_created: u64,
    pub spaces_destroyed: u64,
    pub maps: u64,
    pub unmaps: u64,
    pub protects: u64,
    pub switches: u64,
    pub translations: u64,
    pub page_faults: u64,
    /// Pages invalidated by shootdowns.
    pub shootdowns: u64,
}

impl MmuStats {
    /// Address spaces created and not yet destroyed.
    pub fn live_spaces(&self) -> u64 {
        self.spaces_created - self.spaces_destroyed
    }
}

#[derive(Default)]
pub(crate) struct MmuCounters {
    pub spaces_created: AtomicU64,
    pub spaces_destroyed: AtomicU64,
    pub maps: AtomicU64,
    pub unmaps: AtomicU64,
    pub protects: AtomicU64,
    pub switches: AtomicU64,
    pub translations: AtomicU64,
    pub page_faults: AtomicU64,
    pub shootdowns: AtomicU64,
}

impl MmuCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MmuStats {
        MmuStats {
            spaces_created: self.spaces_created.load(Ordering::Relaxed),
            spaces_destroyed: self.spaces_destroyed.load(Ordering::Relaxed),
            maps: self.maps.load(Ordering::Relaxed),
            unmaps: self.unmaps.load(Ordering::Relaxed),
            protects: self.protects.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            translations: self.translations.load(Ordering::Relaxed),
            page_faults: self.page_faults.load(Ordering::Relaxed),
            shootdowns: self.shootdowns.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the operation counters. Space lifetime counters are kept so
    /// [`MmuStats::live_spaces`] stays meaningful.
    pub fn reset(&self) {
        for counter in [
            &self.maps,
            &self.unmaps,
            &self.protects,
            &self.switches,
            &self.translations,
            &self.page_faults,
            &self.shootdowns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
