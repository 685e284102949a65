#![cfg_attr(not(test), no_std)]

//! # Polaris MMU
//!
//! The virtual memory core of the Polaris kernel. It provides:
//!
//! - Three-level page tables with 4 KiB, 2 MiB and 1 GiB granules.
//! - A per-core software TLB model with FIFO eviction and ASID tagging.
//! - Address translation with permission checks and page fault reporting.
//! - Synchronous TLB shootdown across cores on every table mutation.
//! - A [`Platform`] boundary for barriers, TLB and root register access, with a
//!   software implementation for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod directory;
mod error;
mod fault;
mod frame;
pub mod layout;
mod manager;
mod numbers;
mod platform;
mod region;
mod stats;
mod table;
mod tlb;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use directory::{PageDirectory, Translation};
pub use error::MmuError;
pub use fault::{Access, AccessKind, FaultCause, PageFault};
pub use frame::{FrameAllocator, FramePool};
pub use layout::{Granule, PAGE_SIZE};
pub use manager::{MAX_CORES, Mmu, MmuConfig};
pub use numbers::{Asid, CoreId, FrameNumber};
pub use platform::{Platform, RootHandle};
pub use region::{MAX_REGIONS, MemoryRegion, RegionKind, RegionTable};
pub use stats::MmuStats;
pub use table::{PageEntry, PageFlags, PageTable};
pub use tlb::{Tlb, TlbEntry, TlbStats};

#[cfg(target_arch = "x86_64")]
pub use arch::X86Platform;
#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{PlatformCall, SoftwarePlatform};

#[cfg(test)]
mod tests_prop;
