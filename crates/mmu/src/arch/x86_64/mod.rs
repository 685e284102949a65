//! x86_64 hardware platform.
//!
//! TLB maintenance uses `invlpg` and CR3 reloads, the root register is CR3.
//! PCIDs are not enabled, so the platform reports no ASID tagging and the
//! MMU flushes on every address space switch.
//!
//! The interrupt controller masks are latched in software by the interrupt
//! entry stubs (see [`X86Platform::latch_pending`]), since the legacy
//! controllers do not expose a readable pending bitmap.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::{self, interrupts, tlb},
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{Asid, PhysicalAddress, Platform, RootHandle, VirtualAddress};

/// Number of 64-source words in the latched interrupt masks.
const MASK_WORDS: usize = 16;

/// The x86_64 [`Platform`].
pub struct X86Platform {
    pending: [AtomicU64; MASK_WORDS],
    enabled: [AtomicU64; MASK_WORDS],
}

impl X86Platform {
    /// Creates the platform with every source idle and masked.
    pub const fn new() -> Self {
        Self {
            pending: [const { AtomicU64::new(0) }; MASK_WORDS],
            enabled: [const { AtomicU64::new(0) }; MASK_WORDS],
        }
    }

    /// Marks `source` pending. Called from the interrupt entry stub.
    pub fn latch_pending(&self, source: usize) {
        if let Some(word) = self.pending.get(source / 64) {
            word.fetch_or(1 << (source % 64), Ordering::AcqRel);
        }
    }

    /// Clears the pending mark of `source` once it has been dispatched.
    pub fn clear_pending(&self, source: usize) {
        if let Some(word) = self.pending.get(source / 64) {
            word.fetch_and(!(1 << (source % 64)), Ordering::AcqRel);
        }
    }

    /// Unmasks or masks `source` at the controller.
    pub fn set_enabled(&self, source: usize, enabled: bool) {
        if let Some(word) = self.enabled.get(source / 64) {
            if enabled {
                word.fetch_or(1 << (source % 64), Ordering::AcqRel);
            } else {
                word.fetch_and(!(1 << (source % 64)), Ordering::AcqRel);
            }
        }
    }
}

impl Default for X86Platform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for X86Platform {
    fn fence(&self) {
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    fn invalidate_translation(&self, va: VirtualAddress, _asid: Option<Asid>) {
        tlb::flush(VirtAddr::new_truncate(va.as_usize() as u64));
    }

    fn invalidate_all(&self, _asid: Option<Asid>) {
        tlb::flush_all();
    }

    fn read_active_root(&self) -> RootHandle {
        let (frame, _) = Cr3::read();
        let address = PhysicalAddress::new(frame.start_address().as_u64() as usize);
        RootHandle {
            frame: address.frame_number(),
            asid: Asid::new(0),
        }
    }

    fn write_active_root(&self, root: RootHandle) {
        let base = PhysAddr::new(root.frame.start().as_usize() as u64);
        let frame = PhysFrame::containing_address(base);
        // SAFETY: The MMU only installs roots of live address spaces whose kernel half
        // mirrors the boot mappings, so execution continues in a mapped context.
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }

    fn supports_asid(&self) -> bool {
        false
    }

    fn read_pending_interrupt_mask(&self, word: usize) -> u64 {
        self.pending
            .get(word)
            .map_or(0, |word| word.load(Ordering::Acquire))
    }

    fn read_enabled_interrupt_mask(&self, word: usize) -> u64 {
        self.enabled
            .get(word)
            .map_or(0, |word| word.load(Ordering::Acquire))
    }

    fn halt(&self) {
        interrupts::disable();
        loop {
            instructions::hlt();
        }
    }
}
