//! Translation layout shared by every platform.
//!
//! Three levels of 512-entry tables over a 39-bit canonical virtual address
//! space:
//! - Level 2 (root): bits 30-38, 1 GiB per entry
//! - Level 1: bits 21-29, 2 MiB per entry
//! - Level 0: bits 12-20, 4 KiB per entry
//!
//! A leaf may sit at any level, which is how 1 GiB and 2 MiB granules are
//! expressed.

use core::fmt;

/// Smallest page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of bits used to index one table.
pub const INDEX_BITS: usize = 9;

/// Number of entries per table node.
pub const ENTRY_COUNT: usize = 1 << INDEX_BITS;

/// Number of translation levels.
pub const LEVELS: usize = 3;

/// Level of the root table.
pub const ROOT_LEVEL: usize = LEVELS - 1;

/// Number of significant virtual address bits.
pub const VIRTUAL_BITS: usize = 39;

/// Number of physical address bits a page table entry can encode.
pub const PHYSICAL_BITS: usize = 56;

/// Mask selecting the significant bits of a virtual address.
pub const VIRTUAL_MASK: usize = (1 << VIRTUAL_BITS) - 1;

/// Returns the number of bytes mapped by one entry at `level`.
#[inline]
pub const fn level_size(level: usize) -> usize {
    assert!(level < LEVELS, "level out of range");
    PAGE_SIZE << (INDEX_BITS * level)
}

/// Returns the table index for `address` at `level`.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < LEVELS, "level out of range");
    let shift = 12 + level * INDEX_BITS;
    (address >> shift) & (ENTRY_COUNT - 1)
}

/// Validates a physical address.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> PHYSICAL_BITS == 0
}

/// Validates a virtual address.
///
/// Virtual addresses must be canonical (bits 39-63 must be copies of bit 38).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Canonicalizes a virtual address by sign-extending bit 38.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if addr & (1 << (VIRTUAL_BITS - 1)) != 0 {
        addr | !VIRTUAL_MASK
    } else {
        addr & VIRTUAL_MASK
    }
}

/// A mapping granule: the size a single leaf entry covers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Granule {
    /// 4 KiB leaf at level 0.
    Page4K,
    /// 2 MiB leaf at level 1.
    Huge2M,
    /// 1 GiB leaf at level 2.
    Giant1G,
}

impl Granule {
    /// All granules from largest to smallest, the order map tries them in.
    pub const DESCENDING: [Granule; LEVELS] = [Granule::Giant1G, Granule::Huge2M, Granule::Page4K];

    /// Returns the granule of a leaf at `level`.
    pub const fn from_level(level: usize) -> Self {
        match level {
            0 => Granule::Page4K,
            1 => Granule::Huge2M,
            2 => Granule::Giant1G,
            _ => panic!("level out of range"),
        }
    }

    /// Returns the table level a leaf of this granule lives at.
    pub const fn level(self) -> usize {
        match self {
            Granule::Page4K => 0,
            Granule::Huge2M => 1,
            Granule::Giant1G => 2,
        }
    }

    /// Returns the number of bytes this granule maps.
    pub const fn size(self) -> usize {
        level_size(self.level())
    }
}

impl fmt::Display for Granule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granule::Page4K => write!(f, "4KiB"),
            Granule::Huge2M => write!(f, "2MiB"),
            Granule::Giant1G => write!(f, "1GiB"),
        }
    }
}
