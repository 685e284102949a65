//! Bounded log of recent exceptions.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use mmu::{CoreId, VirtualAddress};

use crate::{DispatchOutcome, ExceptionCause, Severity};

/// One logged exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// Position of this record among every exception ever logged, from 0.
    pub sequence: u64,
    pub core: CoreId,
    pub cause: ExceptionCause,
    pub epc: VirtualAddress,
    pub tval: usize,
    pub severity: Severity,
    pub outcome: DispatchOutcome,
}

/// A ring buffer of the most recent exceptions. Once full, the oldest record
/// is overwritten.
#[derive(Debug)]
pub struct ExceptionLog {
    records: VecDeque<ExceptionRecord>,
    capacity: usize,
    total: u64,
}

impl ExceptionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a record and returns its sequence number.
    ///
    /// A zero-capacity log keeps nothing but still counts.
    pub fn push(
        &mut self,
        core: CoreId,
        cause: ExceptionCause,
        epc: VirtualAddress,
        tval: usize,
        severity: Severity,
        outcome: DispatchOutcome,
    ) -> u64 {
        let sequence = self.total;
        self.total += 1;
        if self.capacity == 0 {
            return sequence;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(ExceptionRecord {
            sequence,
            core,
            cause,
            epc,
            tval,
            severity,
            outcome,
        });
        sequence
    }

    /// Returns the retained records, oldest first.
    pub fn records(&self) -> Vec<ExceptionRecord> {
        self.records.iter().copied().collect()
    }

    pub fn latest(&self) -> Option<&ExceptionRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of exceptions logged since creation, including overwritten ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
