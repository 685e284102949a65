#![cfg_attr(not(test), no_std)]

//! # Polaris trap dispatch
//!
//! Routes exceptions, interrupts and system calls to typed handlers, one
//! [`TrapTable`] per core:
//!
//! - Exceptions fall through to a shared [`FaultRecovery`] coordinator, which
//!   applies a per-class severity ladder and resolves page faults against the
//!   [`mmu`] crate, optionally through a [`DemandPager`].
//! - Interrupts are maskable, prioritized and latched; nesting is opt-in.
//! - System calls return their result to the caller.
//!
//! A critical fault stops the system once, after which every table sharing the
//! coordinator reports [`DispatchOutcome::Halted`].

extern crate alloc;

mod config;
mod error;
mod handler;
mod interrupts;
mod journal;
mod recovery;
mod stats;
mod table;
mod vector;

pub use config::{Severity, TrapConfig};
pub use error::{DispatchError, SyscallError};
pub use handler::{
    ExceptionAction, ExceptionFrame, ExceptionHandler, Handler, InterruptContext,
    InterruptHandler, SyscallFrame, SyscallHandler, Trap,
};
pub use interrupts::{InterruptState, InterruptTable};
pub use journal::{ExceptionLog, ExceptionRecord};
pub use recovery::{DemandPager, FaultInfo, FaultRecovery, RecoveryHook};
pub use stats::{NamespaceStats, RecoveryClassStats, RecoveryStats, TrapStats, VectorStats};
pub use table::{DispatchOutcome, TrapTable};
pub use vector::{
    EXCEPTION_COUNT, ExceptionCause, FaultClass, INTERRUPT_COUNT, Namespace, SYSCALL_COUNT,
};

#[cfg(test)]
mod tests_prop;
