//! Property tests for interrupt priority resolution.

use alloc::sync::Arc;
use alloc::vec::Vec;

use mmu::{CoreId, SoftwarePlatform};
use proptest::prelude::*;
use spin::Mutex;

use crate::{
    FaultRecovery, Handler, INTERRUPT_COUNT, InterruptContext, Namespace, TrapConfig, TrapTable,
};

fn table() -> TrapTable {
    let platform = Arc::new(SoftwarePlatform::new());
    TrapTable::new(
        CoreId::BOOT,
        Arc::new(FaultRecovery::new(TrapConfig::default(), platform)),
    )
}

/// Distinct sources, each with a priority and whether it is enabled.
fn arb_sources() -> impl Strategy<Value = Vec<(usize, u32, bool)>> {
    proptest::collection::btree_map(0..INTERRUPT_COUNT, (0u32..8, any::<bool>()), 1..24)
        .prop_map(|map| map.into_iter().map(|(s, (p, e))| (s, p, e)).collect())
}

proptest! {
    #[test]
    fn highest_pending_wins(sources in arb_sources()) {
        let table = table();
        for &(source, priority, enabled) in &sources {
            table.set_priority(source, priority).unwrap();
            table.raise(source).unwrap();
            if enabled {
                table.enable(source).unwrap();
            }
        }

        let expected = sources
            .iter()
            .filter(|(_, _, enabled)| *enabled)
            .max_by_key(|&&(source, priority, _)| (priority, core::cmp::Reverse(source)))
            .map(|&(source, _, _)| source);
        prop_assert_eq!(table.highest_priority_pending(), expected);
    }

    #[test]
    fn service_order_is_by_priority_then_number(sources in arb_sources()) {
        let table = table();
        let order = Arc::new(Mutex::new(Vec::new()));
        for &(source, priority, enabled) in &sources {
            let order = order.clone();
            table
                .register(
                    Namespace::Interrupt,
                    source,
                    Handler::interrupt(move |context: &InterruptContext<'_>| {
                        order.lock().push(context.source());
                        context.acknowledge();
                    }),
                )
                .unwrap();
            table.set_priority(source, priority).unwrap();
            table.raise(source).unwrap();
            if enabled {
                table.enable(source).unwrap();
            }
        }

        let mut expected: Vec<(u32, usize)> = sources
            .iter()
            .filter(|(_, _, enabled)| *enabled)
            .map(|&(source, priority, _)| (priority, source))
            .collect();
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let expected: Vec<usize> = expected.into_iter().map(|(_, source)| source).collect();

        prop_assert_eq!(table.service_pending(), expected.len());
        prop_assert_eq!(order.lock().clone(), expected);
    }
}
