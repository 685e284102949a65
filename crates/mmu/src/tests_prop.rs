//! Property tests for mapping, translation and the TLB.

use alloc::sync::Arc;

use proptest::prelude::*;

use crate::{
    Access, CoreId, FrameNumber, FramePool, Mmu, MmuConfig, PAGE_SIZE, PageFlags, PhysicalAddress,
    SoftwarePlatform, VirtualAddress,
};

const MIB2: usize = 2 << 20;

fn setup() -> (Arc<FramePool>, Mmu) {
    let pool = Arc::new(FramePool::new(FrameNumber::new(0x10_0000), 64));
    let mmu = Mmu::new(
        MmuConfig {
            tlb_capacity: 16,
            ..MmuConfig::default()
        },
        pool.clone(),
        Arc::new(SoftwarePlatform::new()),
    );
    (pool, mmu)
}

/// A page-aligned base, 2 MiB aligned when `huge` is set so superpages get used.
fn arb_base(max_pages: usize) -> impl Strategy<Value = usize> {
    (0..max_pages, any::<bool>()).prop_map(|(page, huge)| {
        if huge {
            (page * PAGE_SIZE) & !(MIB2 - 1)
        } else {
            page * PAGE_SIZE
        }
    })
}

fn arb_flags() -> impl Strategy<Value = PageFlags> {
    prop_oneof![
        Just(PageFlags::READ),
        Just(PageFlags::RW),
        Just(PageFlags::RX),
        Just(PageFlags::RW | PageFlags::USER),
    ]
}

proptest! {
    #[test]
    fn unmap_after_map_leaves_nothing(
        va in arb_base(4096),
        pa in arb_base(4096),
        pages in 1usize..=1024,
        flags in arb_flags(),
    ) {
        let (pool, mmu) = setup();
        let space = mmu.create_address_space().unwrap();
        let size = pages * PAGE_SIZE;
        mmu.map(&space, VirtualAddress::new(va), PhysicalAddress::new(pa), size, flags, false).unwrap();
        mmu.unmap(&space, VirtualAddress::new(va), size).unwrap();

        for page in 0..pages {
            prop_assert_eq!(mmu.walk(&space, VirtualAddress::new(va + page * PAGE_SIZE)), None);
        }
        prop_assert_eq!(space.node_count(), 1);
        prop_assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn translate_agrees_with_walk(
        va in arb_base(2048),
        pa in arb_base(2048),
        pages in 1usize..=768,
        probes in proptest::collection::vec(0usize..4096 * PAGE_SIZE, 1..32),
    ) {
        let (_pool, mmu) = setup();
        let space = mmu.create_address_space().unwrap();
        mmu.map(&space, VirtualAddress::new(va), PhysicalAddress::new(pa), pages * PAGE_SIZE, PageFlags::RW, false).unwrap();

        for probe in probes {
            let probe = VirtualAddress::new(probe);
            match mmu.walk(&space, probe) {
                Some(walked) => {
                    let translated = mmu.translate(CoreId::BOOT, &space, probe, Access::read()).unwrap();
                    prop_assert_eq!(translated, walked);
                    prop_assert_eq!(translated.phys.as_usize() - pa, probe.as_usize() - va);
                    let cached = mmu
                        .with_tlb(CoreId::BOOT, |tlb| tlb.lookup(probe, space.asid()))
                        .flatten()
                        .map(|entry| entry.translate(probe));
                    prop_assert_eq!(cached, Some(walked));
                }
                None => {
                    prop_assert!(mmu.translate(CoreId::BOOT, &space, probe, Access::read()).is_err());
                }
            }
        }
    }

    #[test]
    fn invalidated_entries_miss(pages in proptest::collection::btree_set(0usize..512, 1..16)) {
        let (_pool, mmu) = setup();
        let space = mmu.create_address_space().unwrap();
        mmu.map(&space, VirtualAddress::new(0), PhysicalAddress::new(0), 512 * PAGE_SIZE, PageFlags::RW, false).unwrap();

        for &page in &pages {
            let va = VirtualAddress::new(page * PAGE_SIZE);
            mmu.translate(CoreId::BOOT, &space, va, Access::read()).unwrap();
            mmu.invalidate_tlb_entry(CoreId::BOOT, va, space.asid()).unwrap();
            let cached = mmu.with_tlb(CoreId::BOOT, |tlb| tlb.lookup(va, space.asid())).flatten();
            prop_assert!(cached.is_none());
        }
    }
}
