//! Per-core trap dispatch.

use alloc::sync::Arc;

use mmu::{CoreId, Platform};
use spin::Mutex;

use crate::interrupts::Admission;
use crate::{
    DispatchError, EXCEPTION_COUNT, ExceptionAction, ExceptionFrame, ExceptionHandler,
    FaultRecovery, Handler, INTERRUPT_COUNT, InterruptContext, InterruptState, InterruptTable,
    Namespace, SYSCALL_COUNT, Severity, SyscallError, SyscallFrame, SyscallHandler, Trap,
    TrapStats,
};

/// The result of dispatching one trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// An interrupt handler ran.
    Serviced,
    /// The interrupt was disabled, unregistered or out of range.
    Spurious,
    /// The interrupt was latched behind a running handler.
    Deferred,
    /// The exception was handled or recovered; the faulting context resumes.
    Resume,
    /// Recovery failed. The faulting context must not be resumed.
    Escalated(Severity),
    /// The system call result, returned to the caller.
    Syscall(Result<usize, SyscallError>),
    /// The system has stopped.
    Halted,
}

impl DispatchOutcome {
    /// Returns true if the interrupted or faulting context may continue.
    pub fn resumes(&self) -> bool {
        !matches!(self, DispatchOutcome::Escalated(_) | DispatchOutcome::Halted)
    }

    /// Converts the failing outcomes into their error kinds.
    pub fn into_result(self) -> Result<Self, DispatchError> {
        match self {
            DispatchOutcome::Escalated(_) => Err(DispatchError::RecoveryFailed),
            DispatchOutcome::Halted => Err(DispatchError::CriticalFault),
            DispatchOutcome::Syscall(Err(SyscallError::UnknownNumber)) => {
                Err(DispatchError::UnknownTrapNumber)
            }
            DispatchOutcome::Syscall(Err(SyscallError::HandlerAbsent)) => {
                Err(DispatchError::HandlerAbsent)
            }
            outcome => Ok(outcome),
        }
    }
}

/// The exception, interrupt and system call vectors of one core.
pub struct TrapTable {
    core: CoreId,
    exceptions: Mutex<[Option<Arc<dyn ExceptionHandler>>; EXCEPTION_COUNT]>,
    interrupts: InterruptTable,
    syscalls: Mutex<[Option<Arc<dyn SyscallHandler>>; SYSCALL_COUNT]>,
    recovery: Arc<FaultRecovery>,
    stats: TrapStats,
}

impl TrapTable {
    pub fn new(core: CoreId, recovery: Arc<FaultRecovery>) -> Self {
        Self {
            core,
            exceptions: Mutex::new([const { None }; EXCEPTION_COUNT]),
            interrupts: InterruptTable::new(),
            syscalls: Mutex::new([const { None }; SYSCALL_COUNT]),
            recovery,
            stats: TrapStats::new(),
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn recovery(&self) -> &Arc<FaultRecovery> {
        &self.recovery
    }

    pub fn interrupts(&self) -> &InterruptTable {
        &self.interrupts
    }

    pub fn stats(&self) -> &TrapStats {
        &self.stats
    }

    /// Installs `handler` for `number` in `namespace`, replacing any previous one.
    pub fn register(
        &self,
        namespace: Namespace,
        number: usize,
        handler: Handler,
    ) -> Result<(), DispatchError> {
        if number >= namespace.count() {
            return Err(DispatchError::UnknownTrapNumber);
        }
        match (namespace, handler) {
            (Namespace::Exception, Handler::Exception(handler)) => {
                self.exceptions.lock()[number] = Some(handler);
            }
            (Namespace::Interrupt, Handler::Interrupt(handler)) => {
                self.interrupts.set_handler(number, Some(handler))?;
            }
            (Namespace::Syscall, Handler::Syscall(handler)) => {
                self.syscalls.lock()[number] = Some(handler);
            }
            _ => return Err(DispatchError::HandlerMismatch),
        }
        log::debug!("{}: registered {} {}", self.core, namespace, number);
        Ok(())
    }

    /// Removes the handler of `number`, restoring the namespace default.
    pub fn unregister(&self, namespace: Namespace, number: usize) -> Result<(), DispatchError> {
        if number >= namespace.count() {
            return Err(DispatchError::UnknownTrapNumber);
        }
        match namespace {
            Namespace::Exception => self.exceptions.lock()[number] = None,
            Namespace::Interrupt => self.interrupts.set_handler(number, None)?,
            Namespace::Syscall => self.syscalls.lock()[number] = None,
        }
        Ok(())
    }

    pub fn is_registered(&self, namespace: Namespace, number: usize) -> bool {
        match namespace {
            Namespace::Exception => self
                .exceptions
                .lock()
                .get(number)
                .is_some_and(Option::is_some),
            Namespace::Interrupt => self.interrupts.is_registered(number),
            Namespace::Syscall => self.syscalls.lock().get(number).is_some_and(Option::is_some),
        }
    }

    pub fn dispatch(&self, trap: Trap) -> DispatchOutcome {
        match trap {
            Trap::Exception(frame) => self.dispatch_exception(&frame),
            Trap::Interrupt(source) => self.dispatch_interrupt(source),
            Trap::Syscall(frame) => self.dispatch_syscall(&frame),
        }
    }

    /// Runs the registered handler for the exception, falling back to fault
    /// recovery when there is none or the handler asks for it.
    pub fn dispatch_exception(&self, frame: &ExceptionFrame) -> DispatchOutcome {
        if self.recovery.is_halted() {
            return DispatchOutcome::Halted;
        }
        let number = frame.cause.value() as usize;
        let Some(index) = frame.cause.index() else {
            log::warn!("{}: exception cause {} out of range", self.core, number);
            self.stats.error(Namespace::Exception, number);
            return self.recovery.handle(self.core, frame);
        };

        let handler = self.exceptions.lock()[index].clone();
        let outcome = match handler {
            None => {
                self.stats.spurious(Namespace::Exception, index);
                self.recovery.handle(self.core, frame)
            }
            Some(handler) => {
                self.stats.invoked(Namespace::Exception, index);
                match handler.handle(frame) {
                    ExceptionAction::Resume => {
                        self.recovery.note_handled(self.core, frame);
                        DispatchOutcome::Resume
                    }
                    ExceptionAction::Recover => self.recovery.handle(self.core, frame),
                }
            }
        };
        if !outcome.resumes() {
            self.stats.error(Namespace::Exception, index);
        }
        outcome
    }

    /// Runs the handler of `source` if it is enabled, registered and not held
    /// back by a running handler.
    pub fn dispatch_interrupt(&self, source: usize) -> DispatchOutcome {
        if self.recovery.is_halted() {
            return DispatchOutcome::Halted;
        }
        let admission = match self.interrupts.admit(source) {
            Ok(admission) => admission,
            Err(_) => {
                log::warn!("{}: interrupt {} out of range", self.core, source);
                self.stats.error(Namespace::Interrupt, source);
                return DispatchOutcome::Spurious;
            }
        };

        match admission {
            Admission::Spurious => {
                log::warn!("{}: spurious interrupt {}", self.core, source);
                self.stats.spurious(Namespace::Interrupt, source);
                DispatchOutcome::Spurious
            }
            Admission::Deferred => {
                log::trace!("{}: interrupt {} deferred", self.core, source);
                DispatchOutcome::Deferred
            }
            Admission::Run(handler, priority) => {
                self.stats.invoked(Namespace::Interrupt, source);
                let context = InterruptContext {
                    source,
                    priority,
                    core: self.core,
                    interrupts: &self.interrupts,
                };
                handler.handle(&context);
                self.interrupts.finish(source);
                if self.recovery.is_halted() {
                    DispatchOutcome::Halted
                } else {
                    DispatchOutcome::Serviced
                }
            }
        }
    }

    pub fn dispatch_syscall(&self, frame: &SyscallFrame) -> DispatchOutcome {
        if self.recovery.is_halted() {
            return DispatchOutcome::Halted;
        }
        let handler = self.syscalls.lock().get(frame.number).cloned();
        let result = match handler {
            None => {
                self.stats.error(Namespace::Syscall, frame.number);
                Err(SyscallError::UnknownNumber)
            }
            Some(None) => {
                log::warn!("{}: syscall {} has no handler", self.core, frame.number);
                self.stats.spurious(Namespace::Syscall, frame.number);
                Err(SyscallError::HandlerAbsent)
            }
            Some(Some(handler)) => {
                self.stats.invoked(Namespace::Syscall, frame.number);
                let result = handler.handle(frame);
                if result.is_err() {
                    self.stats.error(Namespace::Syscall, frame.number);
                }
                result
            }
        };
        DispatchOutcome::Syscall(result)
    }

    pub fn enable(&self, source: usize) -> Result<(), DispatchError> {
        self.interrupts.enable(source)
    }

    pub fn disable(&self, source: usize) -> Result<(), DispatchError> {
        self.interrupts.disable(source)
    }

    pub fn set_priority(&self, source: usize, priority: u32) -> Result<(), DispatchError> {
        self.interrupts.set_priority(source, priority)
    }

    pub fn raise(&self, source: usize) -> Result<(), DispatchError> {
        self.interrupts.raise(source)
    }

    pub fn acknowledge(&self, source: usize) -> Result<(), DispatchError> {
        self.interrupts.acknowledge(source)
    }

    pub fn interrupt_state(&self, source: usize) -> Option<InterruptState> {
        self.interrupts.state(source)
    }

    pub fn highest_priority_pending(&self) -> Option<usize> {
        self.interrupts.highest_priority_pending()
    }

    pub fn latch_from_platform(&self, platform: &dyn Platform) -> usize {
        self.interrupts.latch_from_platform(platform)
    }

    /// Dispatches pending interrupts in priority order until none is left or
    /// one is deferred. Returns the number of handlers run.
    pub fn service_pending(&self) -> usize {
        let mut serviced = 0;
        for _ in 0..INTERRUPT_COUNT {
            let Some(source) = self.interrupts.highest_priority_pending() else {
                break;
            };
            match self.dispatch_interrupt(source) {
                DispatchOutcome::Serviced => serviced += 1,
                DispatchOutcome::Spurious => {}
                _ => break,
            }
        }
        serviced
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use mmu::{SoftwarePlatform, VirtualAddress};

    use super::*;
    use crate::{ExceptionCause, FaultClass, TrapConfig};

    fn setup() -> (Arc<SoftwarePlatform>, Arc<FaultRecovery>, TrapTable) {
        let platform = Arc::new(SoftwarePlatform::new());
        let recovery = Arc::new(FaultRecovery::new(TrapConfig::default(), platform.clone()));
        let table = TrapTable::new(CoreId::BOOT, recovery.clone());
        (platform, recovery, table)
    }

    fn recording(order: &Arc<Mutex<Vec<usize>>>) -> Handler {
        let order = order.clone();
        Handler::interrupt(move |context: &InterruptContext<'_>| {
            order.lock().push(context.source());
            context.acknowledge();
        })
    }

    fn exception(cause: ExceptionCause) -> ExceptionFrame {
        ExceptionFrame::new(cause, VirtualAddress::new(0x1000), 0)
    }

    #[test]
    fn register_checks_range_and_kind() {
        let (_, _, table) = setup();
        let syscall = Handler::syscall(|_: &SyscallFrame| Ok(0));
        assert_eq!(
            table.register(Namespace::Syscall, SYSCALL_COUNT, syscall.clone()),
            Err(DispatchError::UnknownTrapNumber)
        );
        assert_eq!(
            table.register(Namespace::Interrupt, 3, syscall.clone()),
            Err(DispatchError::HandlerMismatch)
        );
        assert_eq!(table.register(Namespace::Syscall, 3, syscall), Ok(()));
        assert!(table.is_registered(Namespace::Syscall, 3));
        assert!(!table.is_registered(Namespace::Interrupt, 3));
    }

    #[test]
    fn last_registration_wins() {
        let (_, _, table) = setup();
        table
            .register(Namespace::Syscall, 1, Handler::syscall(|_: &SyscallFrame| Ok(1)))
            .unwrap();
        table
            .register(Namespace::Syscall, 1, Handler::syscall(|_: &SyscallFrame| Ok(2)))
            .unwrap();
        let frame = SyscallFrame::new(1, [0; 6]);
        assert_eq!(table.dispatch_syscall(&frame), DispatchOutcome::Syscall(Ok(2)));

        table.unregister(Namespace::Syscall, 1).unwrap();
        assert_eq!(
            table.dispatch_syscall(&frame),
            DispatchOutcome::Syscall(Err(SyscallError::HandlerAbsent))
        );
    }

    #[test]
    fn syscall_results_and_counters() {
        let (_, _, table) = setup();
        table
            .register(
                Namespace::Syscall,
                4,
                Handler::syscall(|frame: &SyscallFrame| {
                    if frame.args[0] == 0 {
                        Err(SyscallError::Code(-22))
                    } else {
                        Ok(frame.args[0] + frame.args[1])
                    }
                }),
            )
            .unwrap();

        let call = |args| table.dispatch(Trap::Syscall(SyscallFrame::new(4, args)));
        assert_eq!(call([2, 3, 0, 0, 0, 0]), DispatchOutcome::Syscall(Ok(5)));
        assert_eq!(
            call([0; 6]),
            DispatchOutcome::Syscall(Err(SyscallError::Code(-22)))
        );
        assert_eq!(
            table.dispatch_syscall(&SyscallFrame::new(SYSCALL_COUNT, [0; 6])),
            DispatchOutcome::Syscall(Err(SyscallError::UnknownNumber))
        );

        let stats = table.stats().vector(Namespace::Syscall, 4).unwrap();
        assert_eq!(stats.invocations, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(table.stats().totals(Namespace::Syscall).errors, 2);
    }

    #[test]
    fn unregistered_interrupt_is_spurious() {
        let (_, _, table) = setup();
        table.enable(12).unwrap();
        assert_eq!(table.dispatch_interrupt(12), DispatchOutcome::Spurious);
        assert_eq!(table.stats().vector(Namespace::Interrupt, 12).unwrap().spurious, 1);
        assert_eq!(table.interrupt_state(12), Some(InterruptState::Idle));
        assert_eq!(table.dispatch_interrupt(INTERRUPT_COUNT), DispatchOutcome::Spurious);
    }

    #[test]
    fn disabled_interrupt_latches_until_enabled() {
        let (_, _, table) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));
        table.register(Namespace::Interrupt, 20, recording(&order)).unwrap();

        assert_eq!(table.dispatch_interrupt(20), DispatchOutcome::Spurious);
        assert!(order.lock().is_empty());

        table.enable(20).unwrap();
        assert_eq!(table.interrupt_state(20), Some(InterruptState::Pending));
        assert_eq!(table.service_pending(), 1);
        assert_eq!(*order.lock(), [20]);
        assert_eq!(table.interrupt_state(20), Some(InterruptState::Idle));
    }

    #[test]
    fn services_pending_by_priority() {
        let (_, _, table) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (source, priority) in [(3, 5), (7, 9), (8, 5)] {
            table.register(Namespace::Interrupt, source, recording(&order)).unwrap();
            table.set_priority(source, priority).unwrap();
            table.enable(source).unwrap();
            table.raise(source).unwrap();
        }

        assert_eq!(table.highest_priority_pending(), Some(7));
        assert_eq!(table.service_pending(), 3);
        assert_eq!(*order.lock(), [7, 3, 8]);
        assert_eq!(table.highest_priority_pending(), None);
    }

    #[test]
    fn unacknowledged_interrupt_defers_repeats() {
        let (_, _, table) = setup();
        table
            .register(Namespace::Interrupt, 5, Handler::interrupt(|_: &InterruptContext<'_>| {}))
            .unwrap();
        table.enable(5).unwrap();

        assert_eq!(table.dispatch_interrupt(5), DispatchOutcome::Serviced);
        assert_eq!(table.interrupt_state(5), Some(InterruptState::InService));
        assert_eq!(table.dispatch_interrupt(5), DispatchOutcome::Deferred);

        table.acknowledge(5).unwrap();
        assert_eq!(table.interrupt_state(5), Some(InterruptState::Pending));
        assert_eq!(table.dispatch_interrupt(5), DispatchOutcome::Serviced);
    }

    #[test]
    fn nested_dispatch_needs_opt_in() {
        let (_, _, table) = setup();
        let table = Arc::new(table);
        let inner = Arc::new(Mutex::new(Vec::new()));

        table.register(Namespace::Interrupt, 2, recording(&inner)).unwrap();
        table.set_priority(2, 10).unwrap();
        table.enable(2).unwrap();

        let weak = Arc::downgrade(&table);
        let seen = inner.clone();
        table
            .register(
                Namespace::Interrupt,
                1,
                Handler::interrupt(move |context: &InterruptContext<'_>| {
                    let Some(table) = weak.upgrade() else { return };
                    let blocked = table.dispatch_interrupt(2);
                    context.allow_nesting();
                    let nested = table.dispatch_interrupt(2);
                    seen.lock().push(match (blocked, nested) {
                        (DispatchOutcome::Deferred, DispatchOutcome::Serviced) => 100,
                        _ => 0,
                    });
                    context.acknowledge();
                }),
            )
            .unwrap();
        table.set_priority(1, 1).unwrap();
        table.enable(1).unwrap();

        assert_eq!(table.dispatch_interrupt(1), DispatchOutcome::Serviced);
        assert_eq!(*inner.lock(), [2, 100]);
        assert_eq!(table.interrupts().nesting_depth(), 0);
    }

    #[test]
    fn unhandled_exception_goes_to_recovery() {
        let (_, recovery, table) = setup();
        let outcome = table.dispatch_exception(&exception(ExceptionCause::LOAD_MISALIGNED));
        assert_eq!(outcome, DispatchOutcome::Escalated(Severity::High));
        assert_eq!(outcome.into_result(), Err(DispatchError::RecoveryFailed));

        let stats = table.stats().vector(Namespace::Exception, 4).unwrap();
        assert_eq!(stats.spurious, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(recovery.stats().class(FaultClass::Misaligned).failures, 1);
    }

    #[test]
    fn exception_handler_can_resume_or_defer() {
        let (_, recovery, table) = setup();
        table
            .register(
                Namespace::Exception,
                ExceptionCause::ILLEGAL_INSTRUCTION.value() as usize,
                Handler::exception(|frame: &ExceptionFrame| {
                    if frame.tval == 0 {
                        ExceptionAction::Resume
                    } else {
                        ExceptionAction::Recover
                    }
                }),
            )
            .unwrap();
        recovery.set_hook(FaultClass::IllegalInstruction, |_: &crate::FaultInfo| true);

        let mut frame = exception(ExceptionCause::ILLEGAL_INSTRUCTION);
        assert_eq!(table.dispatch_exception(&frame), DispatchOutcome::Resume);
        assert_eq!(recovery.stats().class(FaultClass::IllegalInstruction).attempts, 0);

        frame.tval = 0xdead;
        assert_eq!(table.dispatch(Trap::Exception(frame)), DispatchOutcome::Resume);
        assert_eq!(recovery.stats().class(FaultClass::IllegalInstruction).successes, 1);
        assert_eq!(recovery.exception_log().total(), 2);
    }

    #[test]
    fn critical_exception_halts_every_table_once() {
        let (platform, recovery, table) = setup();
        let other = TrapTable::new(CoreId::new(1), recovery.clone());
        recovery.set_severity(FaultClass::AccessFault, Severity::Critical);
        other
            .register(Namespace::Interrupt, 1, Handler::interrupt(|_: &InterruptContext<'_>| {}))
            .unwrap();
        other.enable(1).unwrap();

        let frame = exception(ExceptionCause::STORE_ACCESS_FAULT);
        assert_eq!(table.dispatch_exception(&frame), DispatchOutcome::Halted);
        assert_eq!(platform.halts(), 1);

        assert_eq!(table.dispatch_exception(&frame), DispatchOutcome::Halted);
        assert_eq!(other.dispatch_interrupt(1), DispatchOutcome::Halted);
        assert_eq!(
            other.dispatch_syscall(&SyscallFrame::new(0, [0; 6])),
            DispatchOutcome::Halted
        );
        assert_eq!(platform.halts(), 1);
        assert_eq!(other.stats().totals(Namespace::Interrupt).invocations, 0);
    }

    #[test]
    fn out_of_range_exception_fail_stops() {
        let (platform, _, table) = setup();
        let outcome = table.dispatch_exception(&exception(ExceptionCause::new(40)));
        assert_eq!(outcome, DispatchOutcome::Halted);
        assert_eq!(platform.halts(), 1);
        assert_eq!(table.stats().totals(Namespace::Exception).errors, 1);
    }

    #[test]
    fn latches_platform_pending_sources() {
        let (platform, _, table) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));
        table.register(Namespace::Interrupt, 65, recording(&order)).unwrap();
        table.enable(65).unwrap();
        platform.set_pending(65, true);
        platform.set_enabled(65, true);

        assert_eq!(table.latch_from_platform(platform.as_ref()), 1);
        assert_eq!(table.service_pending(), 1);
        assert_eq!(*order.lock(), [65]);
    }
}
