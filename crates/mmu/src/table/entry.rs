//! Page table entry encoding.

use core::fmt;

use crate::{FrameNumber, PhysicalAddress, layout};

use super::flags::PageFlags;

/// A single page table entry.
///
/// The entry format:
/// - Bit 0: Valid
/// - Bit 1: Leaf (set for translations, clear for pointers to the next level)
/// - Bits 2-9: [`PageFlags`] (leaf entries only)
/// - Bits 12-55: Physical address of the mapped frame or the next-level node
///
/// The leaf marker is its own bit, so a pointer entry can never be mistaken for
/// a translation whatever permission bits happen to be set.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    const VALID: u64 = 1 << 0;
    const LEAF: u64 = 1 << 1;
    const FLAGS_MASK: u64 = PageFlags::all().bits();
    const ADDRESS_MASK: u64 = ((1 << layout::PHYSICAL_BITS) - 1) & !(layout::PAGE_SIZE as u64 - 1);

    /// Returns an invalid entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates a leaf entry translating to `address`.
    ///
    /// The address must be aligned to the granule of the level the entry is
    /// stored at; the caller checks that.
    pub fn leaf(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.is_aligned(layout::PAGE_SIZE),
            "leaf address must be page-aligned"
        );
        let addr_bits = address.as_usize() as u64 & Self::ADDRESS_MASK;
        Self(addr_bits | (flags.bits() & Self::FLAGS_MASK) | Self::LEAF | Self::VALID)
    }

    /// Creates a pointer entry referencing the node backed by `node`.
    pub fn table(node: FrameNumber) -> Self {
        let addr_bits = node.start().as_usize() as u64 & Self::ADDRESS_MASK;
        Self(addr_bits | Self::VALID)
    }

    /// Returns whether this entry is valid.
    pub const fn is_valid(self) -> bool {
        self.0 & Self::VALID != 0
    }

    /// Returns whether this entry is a valid leaf.
    pub const fn is_leaf(self) -> bool {
        self.is_valid() && self.0 & Self::LEAF != 0
    }

    /// Returns whether this entry is a valid pointer to a next-level node.
    pub const fn is_table(self) -> bool {
        self.is_valid() && self.0 & Self::LEAF == 0
    }

    /// Returns the physical base of a leaf entry.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_leaf()
            .then(|| PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
    }

    /// Returns the node referenced by a pointer entry.
    pub fn next_table(self) -> Option<FrameNumber> {
        self.is_table()
            .then(|| PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize).frame_number())
    }

    /// Returns the flags of this entry (empty for pointer entries).
    pub fn flags(self) -> PageFlags {
        if self.is_leaf() {
            PageFlags::from_bits_truncate(self.0 & Self::FLAGS_MASK)
        } else {
            PageFlags::empty()
        }
    }

    /// Replaces the flags of a leaf entry, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        debug_assert!(self.is_leaf(), "only leaf entries carry flags");
        self.0 = (self.0 & !Self::FLAGS_MASK) | (flags.bits() & Self::FLAGS_MASK);
    }

    /// Clears this entry (sets it to zero).
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw value of this entry.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(address) = self.address() {
            write!(f, "PageEntry::Leaf({}, {:?})", address, self.flags())
        } else if let Some(node) = self.next_table() {
            write!(f, "PageEntry::Table({})", node)
        } else {
            write!(f, "PageEntry::Invalid")
        }
    }
}
