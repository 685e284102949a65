//! Privileged operations the MMU and trap layers need from the hardware.

use crate::{Asid, FrameNumber, VirtualAddress};

/// The value held by a core's translation root register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootHandle {
    /// Frame backing the root table.
    pub frame: FrameNumber,
    /// Address-space identifier tagging translations made through this root.
    pub asid: Asid,
}

/// Barrier, TLB, root register and interrupt controller primitives.
///
/// Every hardware-touching instruction the core would otherwise emit inline
/// goes through this trait, so the same code runs on real hardware and in a
/// hosted software model.
pub trait Platform: Send + Sync {
    /// Orders all prior page table writes before subsequent translations.
    fn fence(&self);

    /// Drops any hardware-cached translation for `va`, limited to `asid` if given.
    fn invalidate_translation(&self, va: VirtualAddress, asid: Option<Asid>);

    /// Drops every hardware-cached translation, limited to `asid` if given.
    fn invalidate_all(&self, asid: Option<Asid>);

    /// Reads the root register of the calling core.
    fn read_active_root(&self) -> RootHandle;

    /// Writes the root register of the calling core.
    fn write_active_root(&self, root: RootHandle);

    /// Returns true if the hardware tags cached translations with ASIDs.
    fn supports_asid(&self) -> bool;

    /// Reads one 64-source word of the interrupt controller's pending mask.
    fn read_pending_interrupt_mask(&self, word: usize) -> u64;

    /// Reads one 64-source word of the interrupt controller's enable mask.
    fn read_enabled_interrupt_mask(&self, word: usize) -> u64;

    /// Stops the calling core. Hardware implementations never return.
    fn halt(&self);
}
