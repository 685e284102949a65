//! Software model of a core's translation lookaside buffer.
//!
//! The cache is a fixed array of slots. An entry is tagged by the base of the
//! leaf it caches and the ASID of its address space, and covers the whole leaf,
//! so a 2 MiB or 1 GiB mapping occupies a single slot. When the cache is full
//! the oldest inserted entry is evicted (FIFO, lookups do not refresh age).

use alloc::vec::Vec;

use crate::{
    Asid, PageFlags, PhysicalAddress, Translation, VirtualAddress,
    layout::{self, Granule},
};

/// One cached translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbEntry {
    /// Virtual base of the cached leaf.
    pub va: VirtualAddress,
    pub asid: Asid,
    /// Physical base of the cached leaf.
    pub pa: PhysicalAddress,
    pub flags: PageFlags,
    pub granule: Granule,
    seq: u64,
}

impl TlbEntry {
    fn covers(&self, va: VirtualAddress, asid: Asid) -> bool {
        self.asid == asid && va.align_down(self.granule.size()) == self.va
    }

    /// Resolves `va` through this entry.
    pub fn translate(&self, va: VirtualAddress) -> Translation {
        let offset = (va.as_usize() & layout::VIRTUAL_MASK) & (self.granule.size() - 1);
        Translation {
            phys: self.pa + offset,
            flags: self.flags,
            granule: self.granule,
        }
    }
}

/// Counters kept by a [`Tlb`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlbStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    /// Entries removed by single-address invalidation.
    pub invalidations: u64,
    /// Calls to [`Tlb::invalidate_all`] and [`Tlb::retain_asid`].
    pub flushes: u64,
    /// Valid entries at the time of the snapshot.
    pub occupancy: usize,
}

impl TlbStats {
    /// Fraction of lookups that hit, or zero before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// A fixed-capacity, ASID-tagged translation cache.
pub struct Tlb {
    slots: Vec<Option<TlbEntry>>,
    next_seq: u64,
    stats: TlbStats,
}

impl Tlb {
    /// Creates an empty cache with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "TLB capacity must be non-zero");
        Self {
            slots: alloc::vec![None; capacity],
            next_seq: 0,
            stats: TlbStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Looks up the entry covering `va` for `asid`.
    pub fn lookup(&mut self, va: VirtualAddress, asid: Asid) -> Option<TlbEntry> {
        let hit = self.find(va, asid).and_then(|slot| self.slots[slot]);
        if hit.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        hit
    }

    /// Caches a translation.
    ///
    /// An entry with the same tag is replaced in place; otherwise the first
    /// free slot is used, and failing that the oldest entry is evicted.
    pub fn insert(
        &mut self,
        va: VirtualAddress,
        asid: Asid,
        pa: PhysicalAddress,
        flags: PageFlags,
        granule: Granule,
    ) {
        let va = va.align_down(granule.size());
        let entry = TlbEntry {
            va,
            asid,
            pa: pa.align_down(granule.size()),
            flags,
            granule,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.stats.insertions += 1;

        let same_tag = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(e) if e.va == va && e.asid == asid));
        let slot = match same_tag.or_else(|| self.slots.iter().position(Option::is_none)) {
            Some(slot) => slot,
            None => {
                let victim = self.oldest();
                if let Some(old) = self.slots[victim] {
                    log::trace!("tlb evict {} {} for {}", old.asid, old.va, va);
                }
                self.stats.evictions += 1;
                victim
            }
        };
        self.slots[slot] = Some(entry);
    }

    /// Removes the entries covering `va` for `asid`. Returns true if any was present.
    pub fn invalidate(&mut self, va: VirtualAddress, asid: Asid) -> bool {
        let mut removed = false;
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(e) if e.covers(va, asid)) {
                *slot = None;
                self.stats.invalidations += 1;
                removed = true;
            }
        }
        removed
    }

    /// Removes every entry tagged `asid`, or every entry at all when `asid` is `None`.
    pub fn invalidate_all(&mut self, asid: Option<Asid>) {
        self.stats.flushes += 1;
        for slot in self.slots.iter_mut() {
            if matches!((*slot, asid), (Some(e), Some(asid)) if e.asid != asid) {
                continue;
            }
            *slot = None;
        }
    }

    /// Removes every entry not tagged `asid`.
    pub fn retain_asid(&mut self, asid: Asid) {
        self.stats.flushes += 1;
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(e) if e.asid != asid) {
                *slot = None;
            }
        }
    }

    /// Number of valid entries.
    pub fn occupancy(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> TlbStats {
        TlbStats {
            occupancy: self.occupancy(),
            ..self.stats
        }
    }

    /// Resets the counters; cached entries are kept.
    pub fn reset_stats(&mut self) {
        self.stats = TlbStats::default();
    }

    fn find(&self, va: VirtualAddress, asid: Asid) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(e) if e.covers(va, asid)))
    }

    fn oldest(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.map(|e| (index, e.seq)))
            .min_by_key(|&(_, seq)| seq)
            .map_or(0, |(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASID: Asid = Asid::new(1);

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    fn pa(addr: usize) -> PhysicalAddress {
        PhysicalAddress::new(addr)
    }

    #[test]
    fn miss_then_hit() {
        let mut tlb = Tlb::new(4);
        assert!(tlb.lookup(va(0x1000), ASID).is_none());
        tlb.insert(va(0x1000), ASID, pa(0x8000), PageFlags::RW, Granule::Page4K);
        let hit = tlb.lookup(va(0x1abc), ASID).unwrap();
        assert_eq!(hit.translate(va(0x1abc)).phys, pa(0x8abc));

        let stats = tlb.stats();
        assert_eq!((stats.hits, stats.misses, stats.insertions), (1, 1, 1));
        assert_eq!(stats.occupancy, 1);
        assert_eq!(stats.hit_ratio(), 0.5);
    }

    #[test]
    fn asid_is_part_of_the_tag() {
        let mut tlb = Tlb::new(4);
        tlb.insert(va(0x1000), ASID, pa(0x8000), PageFlags::RW, Granule::Page4K);
        assert!(tlb.lookup(va(0x1000), Asid::new(2)).is_none());
    }

    #[test]
    fn superpage_entry_covers_whole_range() {
        let mut tlb = Tlb::new(4);
        tlb.insert(va(0x20_0000), ASID, pa(0x4000_0000), PageFlags::READ, Granule::Huge2M);
        let hit = tlb.lookup(va(0x3f_f123), ASID).unwrap();
        assert_eq!(hit.translate(va(0x3f_f123)).phys, pa(0x401f_f123));
        assert!(tlb.invalidate(va(0x30_0000), ASID));
        assert!(tlb.lookup(va(0x20_0000), ASID).is_none());
    }

    #[test]
    fn same_tag_replaces_in_place() {
        let mut tlb = Tlb::new(2);
        tlb.insert(va(0x1000), ASID, pa(0x8000), PageFlags::RW, Granule::Page4K);
        tlb.insert(va(0x1000), ASID, pa(0x9000), PageFlags::READ, Granule::Page4K);
        assert_eq!(tlb.occupancy(), 1);
        assert_eq!(tlb.lookup(va(0x1000), ASID).unwrap().pa, pa(0x9000));
        assert_eq!(tlb.stats().evictions, 0);
    }

    #[test]
    fn eviction_is_fifo_not_lru() {
        let mut tlb = Tlb::new(2);
        tlb.insert(va(0x1000), ASID, pa(0x1000), PageFlags::RW, Granule::Page4K);
        tlb.insert(va(0x2000), ASID, pa(0x2000), PageFlags::RW, Granule::Page4K);
        // Touching the oldest entry does not save it.
        assert!(tlb.lookup(va(0x1000), ASID).is_some());
        tlb.insert(va(0x3000), ASID, pa(0x3000), PageFlags::RW, Granule::Page4K);

        assert!(tlb.lookup(va(0x1000), ASID).is_none());
        assert!(tlb.lookup(va(0x2000), ASID).is_some());
        assert!(tlb.lookup(va(0x3000), ASID).is_some());
        assert_eq!(tlb.stats().evictions, 1);
    }

    #[test]
    fn freed_slot_is_reused_before_evicting() {
        let mut tlb = Tlb::new(2);
        tlb.insert(va(0x1000), ASID, pa(0x1000), PageFlags::RW, Granule::Page4K);
        tlb.insert(va(0x2000), ASID, pa(0x2000), PageFlags::RW, Granule::Page4K);
        assert!(tlb.invalidate(va(0x2000), ASID));
        tlb.insert(va(0x3000), ASID, pa(0x3000), PageFlags::RW, Granule::Page4K);
        assert!(tlb.lookup(va(0x1000), ASID).is_some());
        assert_eq!(tlb.stats().evictions, 0);
    }

    #[test]
    fn invalidate_then_lookup_misses() {
        let mut tlb = Tlb::new(4);
        tlb.insert(va(0x5000), ASID, pa(0x5000), PageFlags::RW, Granule::Page4K);
        assert!(tlb.invalidate(va(0x5000), ASID));
        assert!(!tlb.invalidate(va(0x5000), ASID));
        assert!(tlb.lookup(va(0x5000), ASID).is_none());
    }

    #[test]
    fn invalidate_all_filters_by_asid() {
        let mut tlb = Tlb::new(4);
        tlb.insert(va(0x1000), Asid::new(1), pa(0x1000), PageFlags::RW, Granule::Page4K);
        tlb.insert(va(0x1000), Asid::new(2), pa(0x2000), PageFlags::RW, Granule::Page4K);
        tlb.invalidate_all(Some(Asid::new(1)));
        assert_eq!(tlb.occupancy(), 1);
        tlb.invalidate_all(None);
        assert_eq!(tlb.occupancy(), 0);
        assert_eq!(tlb.stats().flushes, 2);
    }

    #[test]
    fn retain_asid_drops_other_spaces() {
        let mut tlb = Tlb::new(4);
        tlb.insert(va(0x1000), Asid::new(1), pa(0x1000), PageFlags::RW, Granule::Page4K);
        tlb.insert(va(0x1000), Asid::new(2), pa(0x2000), PageFlags::RW, Granule::Page4K);
        tlb.retain_asid(Asid::new(2));
        assert!(tlb.lookup(va(0x1000), Asid::new(1)).is_none());
        assert!(tlb.lookup(va(0x1000), Asid::new(2)).is_some());
    }

    #[test]
    fn upper_half_offsets() {
        let mut tlb = Tlb::new(1);
        let base = 0xffff_ffc0_0000_0000;
        tlb.insert(va(base), ASID, pa(0), PageFlags::RW, Granule::Giant1G);
        let hit = tlb.lookup(va(base + 0x1234), ASID).unwrap();
        assert_eq!(hit.translate(va(base + 0x1234)).phys, pa(0x1234));
    }
}
