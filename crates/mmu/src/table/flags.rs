//! Permission and status bits carried by leaf entries.

use bitflags::bitflags;

bitflags! {
    /// Flags stored in leaf page table entries.
    ///
    /// The bit positions match the entry encoding (bits 2-9), so flags can be
    /// masked in and out of an entry without shifting.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u64 {
        const READ = 1 << 2;
        const WRITE = 1 << 3;
        const EXECUTE = 1 << 4;
        const USER = 1 << 5;
        const GLOBAL = 1 << 6;
        const CACHEABLE = 1 << 7;
        const ACCESSED = 1 << 8;
        const DIRTY = 1 << 9;

        /// Read and write.
        const RW = Self::READ.bits() | Self::WRITE.bits();
        /// Read and execute.
        const RX = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl PageFlags {
    /// The permission subset of the flags (everything except accessed/dirty).
    pub const PERMISSIONS: Self = Self::READ
        .union(Self::WRITE)
        .union(Self::EXECUTE)
        .union(Self::USER)
        .union(Self::GLOBAL)
        .union(Self::CACHEABLE);

    /// Returns the flags with the accessed/dirty status bits removed.
    pub const fn permissions(self) -> Self {
        self.intersection(Self::PERMISSIONS)
    }
}
