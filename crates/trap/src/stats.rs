//! Per-vector trap counters.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{FaultClass, Namespace};

/// Counters of one trap number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VectorStats {
    /// Times a registered handler ran.
    pub invocations: u64,
    /// Times the trap arrived disabled or without a handler.
    pub spurious: u64,
    /// Times the trap ended in an error.
    pub errors: u64,
}

/// Totals across one namespace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NamespaceStats {
    pub invocations: u64,
    pub spurious: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    invocations: AtomicU64,
    spurious: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn load(&self) -> VectorStats {
        VectorStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            spurious: self.spurious.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.invocations.store(0, Ordering::Relaxed);
        self.spurious.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

struct NamespaceCounters {
    total: Counters,
    vectors: Box<[Counters]>,
}

impl NamespaceCounters {
    fn new(count: usize) -> Self {
        Self {
            total: Counters::default(),
            vectors: (0..count).map(|_| Counters::default()).collect(),
        }
    }
}

/// Invocation, spurious and error counters for every trap number.
pub struct TrapStats {
    exceptions: NamespaceCounters,
    interrupts: NamespaceCounters,
    syscalls: NamespaceCounters,
}

impl TrapStats {
    pub fn new() -> Self {
        Self {
            exceptions: NamespaceCounters::new(Namespace::Exception.count()),
            interrupts: NamespaceCounters::new(Namespace::Interrupt.count()),
            syscalls: NamespaceCounters::new(Namespace::Syscall.count()),
        }
    }

    fn namespace(&self, namespace: Namespace) -> &NamespaceCounters {
        match namespace {
            Namespace::Exception => &self.exceptions,
            Namespace::Interrupt => &self.interrupts,
            Namespace::Syscall => &self.syscalls,
        }
    }

    // Numbers outside the namespace only reach the totals.
    fn bump(&self, namespace: Namespace, number: usize, pick: fn(&Counters) -> &AtomicU64) {
        let counters = self.namespace(namespace);
        pick(&counters.total).fetch_add(1, Ordering::Relaxed);
        if let Some(vector) = counters.vectors.get(number) {
            pick(vector).fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn invoked(&self, namespace: Namespace, number: usize) {
        self.bump(namespace, number, |c| &c.invocations);
    }

    pub(crate) fn spurious(&self, namespace: Namespace, number: usize) {
        self.bump(namespace, number, |c| &c.spurious);
    }

    pub(crate) fn error(&self, namespace: Namespace, number: usize) {
        self.bump(namespace, number, |c| &c.errors);
    }

    /// Returns the counters of one trap number, `None` if it is out of range.
    pub fn vector(&self, namespace: Namespace, number: usize) -> Option<VectorStats> {
        self.namespace(namespace).vectors.get(number).map(Counters::load)
    }

    pub fn totals(&self, namespace: Namespace) -> NamespaceStats {
        let total = self.namespace(namespace).total.load();
        NamespaceStats {
            invocations: total.invocations,
            spurious: total.spurious,
            errors: total.errors,
        }
    }

    /// Returns `(number, stats)` for every number that has been counted at least once.
    pub fn active_vectors(&self, namespace: Namespace) -> Vec<(usize, VectorStats)> {
        self.namespace(namespace)
            .vectors
            .iter()
            .map(Counters::load)
            .enumerate()
            .filter(|(_, stats)| *stats != VectorStats::default())
            .collect()
    }

    pub fn reset(&self) {
        for namespace in [&self.exceptions, &self.interrupts, &self.syscalls] {
            namespace.total.reset();
            namespace.vectors.iter().for_each(Counters::reset);
        }
    }
}

impl Default for TrapStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Recovery outcomes of one fault class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryClassStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// A point-in-time copy of the fault recovery counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub classes: [RecoveryClassStats; FaultClass::COUNT],
    pub escalations: u64,
    pub fail_stops: u64,
}

impl RecoveryStats {
    pub fn class(&self, class: FaultClass) -> RecoveryClassStats {
        self.classes[class.index()]
    }
}

#[derive(Default)]
pub(crate) struct RecoveryCounters {
    attempts: [AtomicU64; FaultClass::COUNT],
    successes: [AtomicU64; FaultClass::COUNT],
    failures: [AtomicU64; FaultClass::COUNT],
    escalations: AtomicU64,
    fail_stops: AtomicU64,
}

impl RecoveryCounters {
    pub fn attempt(&self, class: FaultClass) {
        self.attempts[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn success(&self, class: FaultClass) {
        self.successes[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure(&self, class: FaultClass) {
        self.failures[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn escalation(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fail_stop(&self) {
        self.fail_stops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RecoveryStats {
        let mut stats = RecoveryStats {
            escalations: self.escalations.load(Ordering::Relaxed),
            fail_stops: self.fail_stops.load(Ordering::Relaxed),
            ..RecoveryStats::default()
        };
        for class in FaultClass::ALL {
            let i = class.index();
            stats.classes[i] = RecoveryClassStats {
                attempts: self.attempts[i].load(Ordering::Relaxed),
                successes: self.successes[i].load(Ordering::Relaxed),
                failures: self.failures[i].load(Ordering::Relaxed),
            };
        }
        stats
    }
}
