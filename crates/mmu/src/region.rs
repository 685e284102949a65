//! Fixed memory regions mapped at boot.

use alloc::vec::Vec;
use core::fmt;

use crate::{MmuError, PageFlags, PhysicalAddress, layout::PAGE_SIZE};

/// Maximum number of regions a [`RegionTable`] records.
pub const MAX_REGIONS: usize = 64;

/// What a region of physical memory is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Ram,
    Rom,
    Device,
    Reserved,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Ram => write!(f, "ram"),
            RegionKind::Rom => write!(f, "rom"),
            RegionKind::Device => write!(f, "device"),
            RegionKind::Reserved => write!(f, "reserved"),
        }
    }
}

/// A physically contiguous region that is identity-mapped at boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: PhysicalAddress,
    pub size: usize,
    pub kind: RegionKind,
    /// Explicit protection, overriding the default for `kind`.
    pub protection: Option<PageFlags>,
}

impl MemoryRegion {
    pub const fn new(base: PhysicalAddress, size: usize, kind: RegionKind) -> Self {
        Self {
            base,
            size,
            kind,
            protection: None,
        }
    }

    pub const fn with_protection(mut self, flags: PageFlags) -> Self {
        self.protection = Some(flags);
        self
    }

    /// Returns the first address past the region.
    pub fn end(&self) -> PhysicalAddress {
        self.base + self.size
    }

    /// Returns true if `addr` falls inside the region.
    pub fn contains(&self, addr: PhysicalAddress) -> bool {
        self.base <= addr && addr.as_usize() - self.base.as_usize() < self.size
    }

    /// Returns the flags the region is mapped with, or `None` if it is not mapped.
    ///
    /// RAM is read-write and cacheable, ROM is read-execute and cacheable,
    /// device memory is read-write and uncached. Reserved regions are never
    /// mapped, whatever protection they carry.
    pub fn mapping_flags(&self) -> Option<PageFlags> {
        let default = match self.kind {
            RegionKind::Ram => PageFlags::RW | PageFlags::CACHEABLE,
            RegionKind::Rom => PageFlags::RX | PageFlags::CACHEABLE,
            RegionKind::Device => PageFlags::RW,
            RegionKind::Reserved => return None,
        };
        Some(self.protection.unwrap_or(default))
    }
}

/// A bounded table of registered memory regions.
#[derive(Default)]
pub struct RegionTable {
    regions: Vec<MemoryRegion>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a region.
    pub fn add(&mut self, region: MemoryRegion) -> Result<(), MmuError> {
        if region.size == 0 || region.size % PAGE_SIZE != 0 || !region.base.is_aligned(PAGE_SIZE) {
            return Err(MmuError::Misaligned);
        }
        if self.regions.len() >= MAX_REGIONS {
            return Err(MmuError::RegionTableFull);
        }
        log::debug!(
            "region {} at {} ({} bytes) registered",
            region.kind,
            region.base,
            region.size
        );
        self.regions.push(region);
        Ok(())
    }

    /// Removes the region starting at `base`, keeping the order of the rest.
    pub fn remove(&mut self, base: PhysicalAddress) -> Option<MemoryRegion> {
        let index = self.regions.iter().position(|r| r.base == base)?;
        Some(self.regions.remove(index))
    }

    /// Returns the first registered region containing `addr`.
    pub fn find(&self, addr: PhysicalAddress) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
