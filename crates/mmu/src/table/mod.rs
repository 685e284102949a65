//! Page table nodes and their entry encoding.

use alloc::boxed::Box;

use crate::layout::ENTRY_COUNT;

mod entry;
mod flags;

pub use entry::PageEntry;
pub use flags::PageFlags;

/// A single page table node: 512 entries at one translation level.
///
/// Nodes live in the arena of the [`PageDirectory`](crate::PageDirectory) that
/// owns them, keyed by the frame number that backs them.
pub struct PageTable {
    /// The entries in this page table.
    entries: Box<[PageEntry; ENTRY_COUNT]>,
}

impl PageTable {
    /// Creates a new, empty page table.
    ///
    /// All entries are initialized to zero (not present).
    pub fn new() -> Self {
        Self {
            entries: Box::new([PageEntry::empty(); ENTRY_COUNT]),
        }
    }

    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }

    /// Returns true if no entry in this table is valid.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| !entry.is_valid())
    }

    /// Iterates over `(index, entry)` for every valid entry.
    pub fn valid_entries(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, entry)| entry.is_valid())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
