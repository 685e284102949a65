use core::fmt;

/// Errors returned by page table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// The frame allocator had no frame for a page table node.
    AllocationFailure,
    /// An address or size is not aligned to the smallest page, or the size is zero.
    Misaligned,
    /// A page in the range already has a translation and overwrite was not requested.
    AlreadyMapped,
    /// A page in the range has no translation.
    NotMapped,
    /// The range leaves the canonical virtual or the encodable physical space.
    OutOfRange,
    /// Every address-space identifier is in use.
    AsidExhausted,
    /// The address space is still active on at least one core.
    InUse,
    /// The core index is beyond the configured number of cores.
    UnknownCore,
    /// The region table is full.
    RegionTableFull,
    /// The address space has already been destroyed.
    Destroyed,
}

impl fmt::Display for MmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmuError::AllocationFailure => write!(f, "out of frames for page table nodes"),
            MmuError::Misaligned => write!(f, "address or size is not page-aligned"),
            MmuError::AlreadyMapped => write!(f, "range is already mapped"),
            MmuError::NotMapped => write!(f, "range is not mapped"),
            MmuError::OutOfRange => write!(f, "range exceeds the addressable space"),
            MmuError::AsidExhausted => write!(f, "no address-space identifier available"),
            MmuError::InUse => write!(f, "address space is active on a core"),
            MmuError::UnknownCore => write!(f, "core index out of range"),
            MmuError::RegionTableFull => write!(f, "memory region table is full"),
            MmuError::Destroyed => write!(f, "address space has been destroyed"),
        }
    }
}
