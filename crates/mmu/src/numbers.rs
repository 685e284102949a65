//! Numeric identifiers used throughout the MMU core.
//!
//! Frame numbers, address-space identifiers (ASIDs) and core
//! identifiers are all plain integers underneath; the newtypes keep them from
//! being mixed up.

use crate::{address::PhysicalAddress, layout};
use core::{
    fmt,
    ops::{Add, Sub},
};

/// Macro to define common frame number functionality.
macro_rules! impl_frame_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_frame_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frame numbers are handed out by the frame allocator and double as the opaque\n\
     handle of a page table node."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * layout::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

/// Address-space identifier used to tag TLB entries.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct Asid(u16);

impl Asid {
    /// Creates an ASID from its raw value.
    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw ASID value.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "asid#{}", self.0)
    }
}

/// Index of a processor core.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[repr(transparent)]
pub struct CoreId(usize);

impl CoreId {
    /// The bootstrap core.
    pub const BOOT: Self = Self(0);

    /// Creates a core identifier.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the core index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_start_address() {
        assert_eq!(FrameNumber::new(3).start().as_usize(), 3 * layout::PAGE_SIZE);
    }

    #[test]
    fn frame_from_physical_address() {
        let addr = PhysicalAddress::new(layout::PAGE_SIZE * 3 + 10);
        assert_eq!(FrameNumber::from(addr), FrameNumber::new(3));
    }

    #[test]
    fn frame_arithmetic() {
        let frame = FrameNumber::new(10);
        assert_eq!((frame + 5).as_usize(), 15);
        assert_eq!(FrameNumber::new(10) - FrameNumber::new(3), 7);
    }

    #[test]
    fn identifiers_display() {
        assert_eq!(format!("{}", Asid::new(7)), "asid#7");
        assert_eq!(format!("{}", CoreId::new(2)), "core2");
    }
}
