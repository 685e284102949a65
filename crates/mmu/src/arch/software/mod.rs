//! Software platform for testing and hosted runs.
//!
//! Nothing here touches hardware. The root register is a latch, the interrupt
//! controller is a pair of bitmaps, and every barrier or invalidation is
//! appended to a call log that tests can inspect.

use alloc::{collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::{Asid, FrameNumber, Platform, RootHandle, VirtualAddress};

/// One recorded platform operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlatformCall {
    Fence,
    InvalidateTranslation(VirtualAddress, Option<Asid>),
    InvalidateAll(Option<Asid>),
    WriteRoot(RootHandle),
    Halt,
}

/// A [`Platform`] that records its calls instead of executing them.
pub struct SoftwarePlatform {
    asid_tagging: bool,
    root: Mutex<RootHandle>,
    calls: Mutex<Vec<PlatformCall>>,
    pending: Mutex<BTreeMap<usize, u64>>,
    enabled: Mutex<BTreeMap<usize, u64>>,
    halts: AtomicUsize,
}

impl SoftwarePlatform {
    /// Creates a platform whose TLB tags translations with ASIDs.
    pub fn new() -> Self {
        Self::with_asid_tagging(true)
    }

    /// Creates a platform that has no ASID tagging, so every switch flushes.
    pub fn without_asid() -> Self {
        Self::with_asid_tagging(false)
    }

    fn with_asid_tagging(asid_tagging: bool) -> Self {
        Self {
            asid_tagging,
            root: Mutex::new(RootHandle {
                frame: FrameNumber::new(0),
                asid: Asid::new(0),
            }),
            calls: Mutex::new(Vec::new()),
            pending: Mutex::new(BTreeMap::new()),
            enabled: Mutex::new(BTreeMap::new()),
            halts: AtomicUsize::new(0),
        }
    }

    /// Returns a copy of every call recorded so far.
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().clone()
    }

    /// Forgets the recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Counts the recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&PlatformCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Returns the number of fences issued.
    pub fn fences(&self) -> usize {
        self.count(|call| matches!(call, PlatformCall::Fence))
    }

    /// Returns the number of times [`Platform::halt`] was called.
    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }

    /// Sets or clears the controller's pending bit for `source`.
    pub fn set_pending(&self, source: usize, pending: bool) {
        Self::set_bit(&self.pending, source, pending);
    }

    /// Sets or clears the controller's enable bit for `source`.
    pub fn set_enabled(&self, source: usize, enabled: bool) {
        Self::set_bit(&self.enabled, source, enabled);
    }

    fn set_bit(map: &Mutex<BTreeMap<usize, u64>>, source: usize, value: bool) {
        let mut map = map.lock();
        let word = map.entry(source / 64).or_insert(0);
        if value {
            *word |= 1 << (source % 64);
        } else {
            *word &= !(1 << (source % 64));
        }
    }

    fn record(&self, call: PlatformCall) {
        self.calls.lock().push(call);
    }
}

impl Default for SoftwarePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SoftwarePlatform {
    fn fence(&self) {
        self.record(PlatformCall::Fence);
    }

    fn invalidate_translation(&self, va: VirtualAddress, asid: Option<Asid>) {
        self.record(PlatformCall::InvalidateTranslation(va, asid));
    }

    fn invalidate_all(&self, asid: Option<Asid>) {
        self.record(PlatformCall::InvalidateAll(asid));
    }

    fn read_active_root(&self) -> RootHandle {
        *self.root.lock()
    }

    fn write_active_root(&self, root: RootHandle) {
        *self.root.lock() = root;
        self.record(PlatformCall::WriteRoot(root));
    }

    fn supports_asid(&self) -> bool {
        self.asid_tagging
    }

    fn read_pending_interrupt_mask(&self, word: usize) -> u64 {
        self.pending.lock().get(&word).copied().unwrap_or(0)
    }

    fn read_enabled_interrupt_mask(&self, word: usize) -> u64 {
        self.enabled.lock().get(&word).copied().unwrap_or(0)
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
        self.record(PlatformCall::Halt);
    }
}
