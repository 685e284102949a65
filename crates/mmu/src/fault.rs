//! Access descriptions and translation faults.

use core::fmt;

use crate::{PageFlags, VirtualAddress};

/// The kind of memory access being translated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// A memory access: its kind and the privilege it is made with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Access {
    pub kind: AccessKind,
    pub user: bool,
}

impl Access {
    pub const fn new(kind: AccessKind, user: bool) -> Self {
        Self { kind, user }
    }

    /// Supervisor read.
    pub const fn read() -> Self {
        Self::new(AccessKind::Read, false)
    }

    /// Supervisor write.
    pub const fn write() -> Self {
        Self::new(AccessKind::Write, false)
    }

    /// Supervisor instruction fetch.
    pub const fn execute() -> Self {
        Self::new(AccessKind::Execute, false)
    }

    /// The same access made from user mode.
    pub const fn from_user(self) -> Self {
        Self::new(self.kind, true)
    }

    /// Returns the flags a leaf must carry for this access to be allowed.
    pub fn required_flags(self) -> PageFlags {
        let kind = match self.kind {
            AccessKind::Read => PageFlags::READ,
            AccessKind::Write => PageFlags::WRITE,
            AccessKind::Execute => PageFlags::EXECUTE,
        };
        if self.user { kind | PageFlags::USER } else { kind }
    }

    /// Returns true if a leaf with `flags` allows this access.
    pub fn is_permitted_by(self, flags: PageFlags) -> bool {
        flags.contains(self.required_flags())
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.user { "user" } else { "supervisor" };
        let kind = match self.kind {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Execute => "execute",
        };
        write!(f, "{} {}", mode, kind)
    }
}

/// Why a translation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultCause {
    /// No valid leaf covers the address.
    NotPresent,
    /// A leaf exists but its flags forbid the access.
    PermissionViolation,
    /// The address is outside the translatable (canonical) space.
    Unsupported,
}

/// A failed translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub va: VirtualAddress,
    pub access: Access,
    pub cause: FaultCause,
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cause = match self.cause {
            FaultCause::NotPresent => "not present",
            FaultCause::PermissionViolation => "permission violation",
            FaultCause::Unsupported => "unsupported address",
        };
        write!(f, "page fault at {}: {} ({})", self.va, self.access, cause)
    }
}
