//! Trap namespaces and the numbering within them.

use core::fmt;

use mmu::AccessKind;

/// Number of exception causes.
pub const EXCEPTION_COUNT: usize = 16;
/// Number of interrupt sources.
pub const INTERRUPT_COUNT: usize = 1024;
/// Number of system call numbers.
pub const SYSCALL_COUNT: usize = 64;

/// Defines a named newtype over a trap number.
macro_rules! trap_vectors {
    (
        $(#[$meta:meta])*
        $vis:vis struct $type:ident($storage:ty);
        $(
            $name:ident = $value:literal,
        )*
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $vis struct $type($storage);

        impl $type {
            $(
                pub const $name: Self = Self($value);
            )*

            /// Creates a vector from a raw value.
            pub const fn new(value: $storage) -> Self {
                Self(value)
            }

            /// Returns the raw value of the vector.
            pub const fn value(&self) -> $storage {
                self.0
            }

            /// Returns the name of the vector, if known.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $(
                        $value => Some(stringify!($name)),
                    )*
                    _ => None,
                }
            }
        }

        impl fmt::Debug for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "{}::{}({})", stringify!($type), name, self.0)
                } else {
                    write!(f, "{}({})", stringify!($type), self.0)
                }
            }
        }

        impl fmt::Display for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "{}", name)
                } else {
                    write!(f, "{}", self.0)
                }
            }
        }
    };
}

trap_vectors! {
    /// A synchronous exception cause, numbered as in the RISC-V `scause` register.
    pub struct ExceptionCause(u16);
    INSTRUCTION_MISALIGNED = 0,
    INSTRUCTION_ACCESS_FAULT = 1,
    ILLEGAL_INSTRUCTION = 2,
    BREAKPOINT = 3,
    LOAD_MISALIGNED = 4,
    LOAD_ACCESS_FAULT = 5,
    STORE_MISALIGNED = 6,
    STORE_ACCESS_FAULT = 7,
    USER_ECALL = 8,
    SUPERVISOR_ECALL = 9,
    MACHINE_ECALL = 11,
    INSTRUCTION_PAGE_FAULT = 12,
    LOAD_PAGE_FAULT = 13,
    STORE_PAGE_FAULT = 15,
}

impl ExceptionCause {
    /// Returns the slot index, or `None` for numbers outside the namespace.
    pub fn index(self) -> Option<usize> {
        let index = self.0 as usize;
        (index < EXCEPTION_COUNT).then_some(index)
    }

    /// Returns the recovery class of this cause.
    pub fn class(self) -> FaultClass {
        match self {
            Self::INSTRUCTION_MISALIGNED | Self::LOAD_MISALIGNED | Self::STORE_MISALIGNED => {
                FaultClass::Misaligned
            }
            Self::INSTRUCTION_ACCESS_FAULT | Self::LOAD_ACCESS_FAULT | Self::STORE_ACCESS_FAULT => {
                FaultClass::AccessFault
            }
            Self::ILLEGAL_INSTRUCTION => FaultClass::IllegalInstruction,
            Self::BREAKPOINT => FaultClass::Breakpoint,
            Self::USER_ECALL | Self::SUPERVISOR_ECALL | Self::MACHINE_ECALL => {
                FaultClass::EnvironmentCall
            }
            Self::INSTRUCTION_PAGE_FAULT | Self::LOAD_PAGE_FAULT | Self::STORE_PAGE_FAULT => {
                FaultClass::PageFault
            }
            _ => FaultClass::Unknown,
        }
    }

    /// Returns the kind of memory access that raised this cause, if any.
    pub fn access_kind(self) -> Option<AccessKind> {
        match self {
            Self::INSTRUCTION_MISALIGNED
            | Self::INSTRUCTION_ACCESS_FAULT
            | Self::INSTRUCTION_PAGE_FAULT => Some(AccessKind::Execute),
            Self::LOAD_MISALIGNED | Self::LOAD_ACCESS_FAULT | Self::LOAD_PAGE_FAULT => {
                Some(AccessKind::Read)
            }
            Self::STORE_MISALIGNED | Self::STORE_ACCESS_FAULT | Self::STORE_PAGE_FAULT => {
                Some(AccessKind::Write)
            }
            _ => None,
        }
    }
}

/// How an exception is recovered from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FaultClass {
    Misaligned,
    AccessFault,
    IllegalInstruction,
    PageFault,
    Breakpoint,
    EnvironmentCall,
    Unknown,
}

impl FaultClass {
    pub const COUNT: usize = 7;

    pub const ALL: [FaultClass; Self::COUNT] = [
        FaultClass::Misaligned,
        FaultClass::AccessFault,
        FaultClass::IllegalInstruction,
        FaultClass::PageFault,
        FaultClass::Breakpoint,
        FaultClass::EnvironmentCall,
        FaultClass::Unknown,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultClass::Misaligned => "misaligned access",
            FaultClass::AccessFault => "access fault",
            FaultClass::IllegalInstruction => "illegal instruction",
            FaultClass::PageFault => "page fault",
            FaultClass::Breakpoint => "breakpoint",
            FaultClass::EnvironmentCall => "environment call",
            FaultClass::Unknown => "unknown exception",
        };
        write!(f, "{}", name)
    }
}

/// One of the three independent trap numbering spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    Exception,
    Interrupt,
    Syscall,
}

impl Namespace {
    /// Number of slots in this namespace.
    pub const fn count(self) -> usize {
        match self {
            Namespace::Exception => EXCEPTION_COUNT,
            Namespace::Interrupt => INTERRUPT_COUNT,
            Namespace::Syscall => SYSCALL_COUNT,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Exception => write!(f, "exception"),
            Namespace::Interrupt => write!(f, "interrupt"),
            Namespace::Syscall => write!(f, "syscall"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_formatting() {
        assert_eq!(ExceptionCause::LOAD_PAGE_FAULT.name(), Some("LOAD_PAGE_FAULT"));
        assert_eq!(ExceptionCause::new(10).name(), None);
        assert_eq!(format!("{}", ExceptionCause::BREAKPOINT), "BREAKPOINT");
        assert_eq!(
            format!("{:?}", ExceptionCause::new(14)),
            "ExceptionCause(14)"
        );
    }

    #[test]
    fn classes() {
        assert_eq!(ExceptionCause::STORE_PAGE_FAULT.class(), FaultClass::PageFault);
        assert_eq!(ExceptionCause::LOAD_MISALIGNED.class(), FaultClass::Misaligned);
        assert_eq!(ExceptionCause::MACHINE_ECALL.class(), FaultClass::EnvironmentCall);
        assert_eq!(ExceptionCause::new(10).class(), FaultClass::Unknown);
        assert_eq!(ExceptionCause::new(40).class(), FaultClass::Unknown);
    }

    #[test]
    fn access_kinds() {
        assert_eq!(
            ExceptionCause::INSTRUCTION_PAGE_FAULT.access_kind(),
            Some(AccessKind::Execute)
        );
        assert_eq!(ExceptionCause::STORE_ACCESS_FAULT.access_kind(), Some(AccessKind::Write));
        assert_eq!(ExceptionCause::BREAKPOINT.access_kind(), None);
    }

    #[test]
    fn index_is_bounded() {
        assert_eq!(ExceptionCause::STORE_PAGE_FAULT.index(), Some(15));
        assert_eq!(ExceptionCause::new(16).index(), None);
    }
}
