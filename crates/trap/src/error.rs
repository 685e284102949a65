use core::fmt;

/// Errors returned by trap table operations and by [`DispatchOutcome::into_result`].
///
/// [`DispatchOutcome::into_result`]: crate::DispatchOutcome::into_result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The number is outside its namespace.
    UnknownTrapNumber,
    /// The handler kind does not belong to the namespace it was registered in.
    HandlerMismatch,
    /// No handler is registered for the number.
    HandlerAbsent,
    /// Recovery failed and the fault was escalated.
    RecoveryFailed,
    /// The fault was fatal and the system has stopped.
    CriticalFault,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::UnknownTrapNumber => write!(f, "trap number out of range"),
            DispatchError::HandlerMismatch => write!(f, "handler does not match the namespace"),
            DispatchError::HandlerAbsent => write!(f, "no handler registered"),
            DispatchError::RecoveryFailed => write!(f, "fault recovery failed"),
            DispatchError::CriticalFault => write!(f, "critical fault, system halted"),
        }
    }
}

/// Errors a system call returns to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// The system call number is outside the table.
    UnknownNumber,
    /// No handler is registered for the number.
    HandlerAbsent,
    /// The handler failed with its own error code.
    Code(isize),
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyscallError::UnknownNumber => write!(f, "unknown system call"),
            SyscallError::HandlerAbsent => write!(f, "system call not implemented"),
            SyscallError::Code(code) => write!(f, "system call failed with {}", code),
        }
    }
}
