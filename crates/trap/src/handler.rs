//! Typed trap handlers and the frames they receive.

use alloc::sync::Arc;
use core::fmt;

use mmu::{AddressSpace, CoreId, VirtualAddress};

use crate::{ExceptionCause, InterruptTable, Namespace, SyscallError};

/// The saved state of a synchronous exception.
#[derive(Clone)]
pub struct ExceptionFrame {
    pub cause: ExceptionCause,
    /// Address of the faulting instruction.
    pub epc: VirtualAddress,
    /// Cause-specific value, the faulting address for memory faults.
    pub tval: usize,
    /// True if the exception was taken from user mode.
    pub user: bool,
    /// Address space active when the exception was taken.
    pub space: Option<Arc<AddressSpace>>,
}

impl ExceptionFrame {
    pub fn new(cause: ExceptionCause, epc: VirtualAddress, tval: usize) -> Self {
        Self {
            cause,
            epc,
            tval,
            user: false,
            space: None,
        }
    }

    pub fn from_user(mut self) -> Self {
        self.user = true;
        self
    }

    pub fn in_space(mut self, space: Arc<AddressSpace>) -> Self {
        self.space = Some(space);
        self
    }
}

impl fmt::Debug for ExceptionFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionFrame")
            .field("cause", &self.cause)
            .field("epc", &self.epc)
            .field("tval", &format_args!("{:#x}", self.tval))
            .field("user", &self.user)
            .field("asid", &self.space.as_ref().map(|space| space.asid()))
            .finish()
    }
}

/// Arguments of a system call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallFrame {
    pub number: usize,
    pub args: [usize; 6],
}

impl SyscallFrame {
    pub const fn new(number: usize, args: [usize; 6]) -> Self {
        Self { number, args }
    }
}

/// A trap as delivered to [`TrapTable::dispatch`](crate::TrapTable::dispatch).
#[derive(Clone, Debug)]
pub enum Trap {
    Exception(ExceptionFrame),
    Interrupt(usize),
    Syscall(SyscallFrame),
}

/// What an exception handler wants done after it returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionAction {
    /// The exception was handled, resume the faulting context.
    Resume,
    /// Hand the exception to fault recovery.
    Recover,
}

pub trait ExceptionHandler: Send + Sync {
    fn handle(&self, frame: &ExceptionFrame) -> ExceptionAction;
}

impl<F> ExceptionHandler for F
where
    F: Fn(&ExceptionFrame) -> ExceptionAction + Send + Sync,
{
    fn handle(&self, frame: &ExceptionFrame) -> ExceptionAction {
        self(frame)
    }
}

/// What an interrupt handler sees while it runs.
pub struct InterruptContext<'a> {
    pub(crate) source: usize,
    pub(crate) priority: u32,
    pub(crate) core: CoreId,
    pub(crate) interrupts: &'a InterruptTable,
}

impl InterruptContext<'_> {
    pub fn source(&self) -> usize {
        self.source
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Lets strictly higher priority sources preempt this handler.
    pub fn allow_nesting(&self) {
        self.interrupts.allow_nesting(self.source);
    }

    /// Marks the source as serviced before the handler returns.
    pub fn acknowledge(&self) {
        let _ = self.interrupts.acknowledge(self.source);
    }
}

pub trait InterruptHandler: Send + Sync {
    fn handle(&self, context: &InterruptContext<'_>);
}

impl<F> InterruptHandler for F
where
    F: Fn(&InterruptContext<'_>) + Send + Sync,
{
    fn handle(&self, context: &InterruptContext<'_>) {
        self(context)
    }
}

pub trait SyscallHandler: Send + Sync {
    fn handle(&self, frame: &SyscallFrame) -> Result<usize, SyscallError>;
}

impl<F> SyscallHandler for F
where
    F: Fn(&SyscallFrame) -> Result<usize, SyscallError> + Send + Sync,
{
    fn handle(&self, frame: &SyscallFrame) -> Result<usize, SyscallError> {
        self(frame)
    }
}

/// A handler for one of the three namespaces.
#[derive(Clone)]
pub enum Handler {
    Exception(Arc<dyn ExceptionHandler>),
    Interrupt(Arc<dyn InterruptHandler>),
    Syscall(Arc<dyn SyscallHandler>),
}

impl Handler {
    pub fn exception(handler: impl ExceptionHandler + 'static) -> Self {
        Handler::Exception(Arc::new(handler))
    }

    pub fn interrupt(handler: impl InterruptHandler + 'static) -> Self {
        Handler::Interrupt(Arc::new(handler))
    }

    pub fn syscall(handler: impl SyscallHandler + 'static) -> Self {
        Handler::Syscall(Arc::new(handler))
    }

    /// Returns the namespace this handler can be registered in.
    pub fn namespace(&self) -> Namespace {
        match self {
            Handler::Exception(_) => Namespace::Exception,
            Handler::Interrupt(_) => Namespace::Interrupt,
            Handler::Syscall(_) => Namespace::Syscall,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{:?}", self.namespace())
    }
}
