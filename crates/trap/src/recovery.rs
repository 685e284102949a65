//! Severity-driven fault recovery and fail-stop.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use mmu::{Access, AddressSpace, CoreId, Mmu, MmuError, Platform, VirtualAddress};
use spin::{Mutex, MutexGuard};

use crate::stats::RecoveryCounters;
use crate::{
    DispatchOutcome, ExceptionCause, ExceptionFrame, ExceptionLog, FaultClass, RecoveryStats,
    Severity, TrapConfig,
};

/// What a recovery hook or pager learns about a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    pub core: CoreId,
    pub cause: ExceptionCause,
    pub class: FaultClass,
    pub severity: Severity,
    pub epc: VirtualAddress,
    /// The trap value, the faulting address for memory faults.
    pub address: usize,
    /// The access that faulted, for memory faults.
    pub access: Option<Access>,
}

impl FaultInfo {
    fn new(core: CoreId, frame: &ExceptionFrame, severity: Severity) -> Self {
        Self {
            core,
            cause: frame.cause,
            class: frame.cause.class(),
            severity,
            epc: frame.epc,
            address: frame.tval,
            access: frame
                .cause
                .access_kind()
                .map(|kind| Access::new(kind, frame.user)),
        }
    }
}

/// Resolves page faults by installing mappings, typically on demand.
///
/// A pager returning `Ok` must leave the address translatable for the
/// faulting access, otherwise the fault still counts as failed.
pub trait DemandPager: Send + Sync {
    fn resolve(
        &self,
        space: &Arc<AddressSpace>,
        va: VirtualAddress,
        access: Access,
    ) -> Result<(), MmuError>;
}

impl<F> DemandPager for F
where
    F: Fn(&Arc<AddressSpace>, VirtualAddress, Access) -> Result<(), MmuError> + Send + Sync,
{
    fn resolve(
        &self,
        space: &Arc<AddressSpace>,
        va: VirtualAddress,
        access: Access,
    ) -> Result<(), MmuError> {
        self(space, va, access)
    }
}

/// Attempts to repair a misaligned access, access fault or illegal instruction.
pub trait RecoveryHook: Send + Sync {
    /// Returns true if the faulting context can resume.
    fn recover(&self, fault: &FaultInfo) -> bool;
}

impl<F> RecoveryHook for F
where
    F: Fn(&FaultInfo) -> bool + Send + Sync,
{
    fn recover(&self, fault: &FaultInfo) -> bool {
        self(fault)
    }
}

/// Decides what happens to exceptions that no handler resolved.
///
/// One coordinator is shared by the trap tables of every core, so the
/// fail-stop it triggers is system-wide.
pub struct FaultRecovery {
    config: Mutex<TrapConfig>,
    platform: Arc<dyn Platform>,
    mmu: Option<Arc<Mmu>>,
    pager: Mutex<Option<Arc<dyn DemandPager>>>,
    hooks: Mutex<[Option<Arc<dyn RecoveryHook>>; FaultClass::COUNT]>,
    recovery_enabled: AtomicBool,
    logging_enabled: AtomicBool,
    halted: AtomicBool,
    log: Mutex<ExceptionLog>,
    counters: RecoveryCounters,
}

impl FaultRecovery {
    pub fn new(config: TrapConfig, platform: Arc<dyn Platform>) -> Self {
        Self {
            config: Mutex::new(config),
            platform,
            mmu: None,
            pager: Mutex::new(None),
            hooks: Mutex::new([const { None }; FaultClass::COUNT]),
            recovery_enabled: AtomicBool::new(true),
            logging_enabled: AtomicBool::new(true),
            halted: AtomicBool::new(false),
            log: Mutex::new(ExceptionLog::new(config.exception_log_capacity)),
            counters: RecoveryCounters::default(),
        }
    }

    /// Attaches the MMU page faults are resolved against.
    pub fn with_mmu(mut self, mmu: Arc<Mmu>) -> Self {
        self.mmu = Some(mmu);
        self
    }

    pub fn set_pager(&self, pager: impl DemandPager + 'static) {
        *self.pager.lock() = Some(Arc::new(pager));
    }

    pub fn clear_pager(&self) {
        *self.pager.lock() = None;
    }

    /// Installs the hook for `class`, replacing any previous one.
    ///
    /// Hooks only run for misaligned accesses, access faults and illegal
    /// instructions; other classes ignore them.
    pub fn set_hook(&self, class: FaultClass, hook: impl RecoveryHook + 'static) {
        self.hooks.lock()[class.index()] = Some(Arc::new(hook));
    }

    pub fn clear_hook(&self, class: FaultClass) {
        self.hooks.lock()[class.index()] = None;
    }

    pub fn severity(&self, class: FaultClass) -> Severity {
        self.config.lock().severity(class)
    }

    pub fn set_severity(&self, class: FaultClass, severity: Severity) {
        let mut config = self.config.lock();
        *config = config.with_severity(class, severity);
    }

    pub fn enable_recovery(&self, enabled: bool) {
        self.recovery_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enable_logging(&self, enabled: bool) {
        self.logging_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Returns true once a fail-stop has happened.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RecoveryStats {
        self.counters.snapshot()
    }

    pub fn exception_log(&self) -> MutexGuard<'_, ExceptionLog> {
        self.log.lock()
    }

    /// Applies the severity ladder to an exception taken on `core`.
    pub fn handle(&self, core: CoreId, frame: &ExceptionFrame) -> DispatchOutcome {
        if self.is_halted() {
            return DispatchOutcome::Halted;
        }
        let info = FaultInfo::new(core, frame, self.severity(frame.cause.class()));
        let outcome = match info.severity {
            Severity::Low => {
                log::info!("{} on {} at {}, resuming", info.class, core, info.epc);
                DispatchOutcome::Resume
            }
            Severity::Critical => return self.fail_stop(&info),
            Severity::Medium | Severity::High => {
                if self.recover(&info, frame) {
                    DispatchOutcome::Resume
                } else {
                    self.counters.escalation();
                    let escalated = info.severity.escalate();
                    if escalated == Severity::Critical {
                        return self.fail_stop(&FaultInfo {
                            severity: escalated,
                            ..info
                        });
                    }
                    log::warn!(
                        "unrecovered {} on {} at {} (tval {:#x}), escalated to {}",
                        info.class,
                        core,
                        info.epc,
                        info.address,
                        escalated
                    );
                    DispatchOutcome::Escalated(escalated)
                }
            }
        };
        self.record(&info, outcome);
        outcome
    }

    /// Logs an exception a registered handler resolved on its own.
    pub(crate) fn note_handled(&self, core: CoreId, frame: &ExceptionFrame) {
        let info = FaultInfo::new(core, frame, self.severity(frame.cause.class()));
        self.record(&info, DispatchOutcome::Resume);
    }

    fn record(&self, info: &FaultInfo, outcome: DispatchOutcome) {
        if !self.logging_enabled.load(Ordering::Relaxed) {
            return;
        }
        self.log.lock().push(
            info.core,
            info.cause,
            info.epc,
            info.address,
            info.severity,
            outcome,
        );
    }

    fn recover(&self, info: &FaultInfo, frame: &ExceptionFrame) -> bool {
        self.counters.attempt(info.class);
        // Breakpoints resume even with recovery switched off so a debugger can
        // still attach.
        let recovered = match info.class {
            FaultClass::Breakpoint => true,
            _ if !self.recovery_enabled.load(Ordering::Relaxed) => false,
            FaultClass::EnvironmentCall | FaultClass::Unknown => false,
            FaultClass::PageFault => self.recover_page_fault(info, frame),
            FaultClass::Misaligned | FaultClass::AccessFault | FaultClass::IllegalInstruction => {
                let hook = self.hooks.lock()[info.class.index()].clone();
                hook.is_some_and(|hook| hook.recover(info))
            }
        };
        if recovered {
            self.counters.success(info.class);
        } else {
            self.counters.failure(info.class);
        }
        recovered
    }

    fn recover_page_fault(&self, info: &FaultInfo, frame: &ExceptionFrame) -> bool {
        let (Some(mmu), Some(space), Some(access)) = (&self.mmu, &frame.space, info.access) else {
            return false;
        };
        let va = VirtualAddress::from_raw(info.address);
        if !va.is_canonical() {
            return false;
        }

        // Another core may have mapped the page since the fault was taken.
        if mmu.translate(info.core, space, va, access).is_ok() {
            return true;
        }

        let Some(pager) = self.pager.lock().clone() else {
            return false;
        };
        if let Err(err) = pager.resolve(space, va, access) {
            log::debug!("pager could not resolve {} for {}: {}", va, access, err);
            return false;
        }
        mmu.translate(info.core, space, va, access).is_ok()
    }

    /// Stops the system. Only the first call has any effect.
    fn fail_stop(&self, info: &FaultInfo) -> DispatchOutcome {
        if self.halted.swap(true, Ordering::AcqRel) {
            return DispatchOutcome::Halted;
        }
        self.counters.fail_stop();
        self.record(info, DispatchOutcome::Halted);
        log::error!(
            "fatal {} ({}) on {} at {}, tval {:#x}: halting",
            info.class,
            info.cause,
            info.core,
            info.epc,
            info.address
        );
        log::logger().flush();
        self.platform.halt();
        DispatchOutcome::Halted
    }
}

#[cfg(test)]
mod tests {
    use mmu::{
        FrameNumber, FramePool, MmuConfig, PAGE_SIZE, PageFlags, PhysicalAddress, SoftwarePlatform,
    };

    use super::*;

    fn recovery() -> (Arc<SoftwarePlatform>, FaultRecovery) {
        let platform = Arc::new(SoftwarePlatform::new());
        let recovery = FaultRecovery::new(TrapConfig::default(), platform.clone());
        (platform, recovery)
    }

    fn frame(cause: ExceptionCause) -> ExceptionFrame {
        ExceptionFrame::new(cause, VirtualAddress::new(0x40_0000), 0x1234)
    }

    #[test]
    fn low_severity_resumes() {
        let (platform, recovery) = recovery();
        let outcome = recovery.handle(CoreId::BOOT, &frame(ExceptionCause::BREAKPOINT));
        assert_eq!(outcome, DispatchOutcome::Resume);
        assert_eq!(platform.halts(), 0);
        assert_eq!(recovery.stats().class(FaultClass::Breakpoint).attempts, 0);
        assert_eq!(recovery.exception_log().len(), 1);
    }

    #[test]
    fn missing_hook_escalates_medium_to_high() {
        let (platform, recovery) = recovery();
        let outcome = recovery.handle(CoreId::BOOT, &frame(ExceptionCause::LOAD_MISALIGNED));
        assert_eq!(outcome, DispatchOutcome::Escalated(Severity::High));
        assert_eq!(platform.halts(), 0);

        let stats = recovery.stats();
        assert_eq!(stats.class(FaultClass::Misaligned).failures, 1);
        assert_eq!(stats.escalations, 1);
        assert_eq!(
            recovery.exception_log().latest().map(|r| r.outcome),
            Some(DispatchOutcome::Escalated(Severity::High))
        );
    }

    #[test]
    fn hook_recovers() {
        let (_, recovery) = recovery();
        recovery.set_hook(FaultClass::IllegalInstruction, |fault: &FaultInfo| {
            fault.address == 0x1234
        });
        let outcome = recovery.handle(CoreId::BOOT, &frame(ExceptionCause::ILLEGAL_INSTRUCTION));
        assert_eq!(outcome, DispatchOutcome::Resume);
        assert_eq!(recovery.stats().class(FaultClass::IllegalInstruction).successes, 1);
    }

    #[test]
    fn disabled_recovery_fails() {
        let (_, recovery) = recovery();
        recovery.set_hook(FaultClass::Misaligned, |_: &FaultInfo| true);
        recovery.enable_recovery(false);
        let outcome = recovery.handle(CoreId::BOOT, &frame(ExceptionCause::STORE_MISALIGNED));
        assert_eq!(outcome, DispatchOutcome::Escalated(Severity::High));
    }

    #[test]
    fn breakpoint_resumes_with_recovery_disabled() {
        let (platform, recovery) = recovery();
        recovery.enable_recovery(false);
        for severity in [Severity::Medium, Severity::High] {
            recovery.set_severity(FaultClass::Breakpoint, severity);
            let outcome = recovery.handle(CoreId::BOOT, &frame(ExceptionCause::BREAKPOINT));
            assert_eq!(outcome, DispatchOutcome::Resume);
        }
        assert_eq!(platform.halts(), 0);
        assert_eq!(recovery.stats().class(FaultClass::Breakpoint).successes, 2);
        assert_eq!(recovery.stats().escalations, 0);
    }

    #[test]
    fn critical_halts_once() {
        let (platform, recovery) = recovery();
        recovery.set_severity(FaultClass::IllegalInstruction, Severity::Critical);

        let cause = ExceptionCause::ILLEGAL_INSTRUCTION;
        assert_eq!(recovery.handle(CoreId::BOOT, &frame(cause)), DispatchOutcome::Halted);
        assert_eq!(recovery.handle(CoreId::new(1), &frame(cause)), DispatchOutcome::Halted);
        assert!(recovery.is_halted());
        assert_eq!(platform.halts(), 1);
        assert_eq!(recovery.stats().fail_stops, 1);
        assert_eq!(recovery.exception_log().len(), 1);
    }

    #[test]
    fn high_failure_fail_stops() {
        let (platform, recovery) = recovery();
        let outcome = recovery.handle(CoreId::BOOT, &frame(ExceptionCause::USER_ECALL));
        assert_eq!(outcome, DispatchOutcome::Halted);
        assert_eq!(platform.halts(), 1);
        assert_eq!(
            recovery.exception_log().latest().map(|r| r.severity),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn logging_can_be_disabled() {
        let (_, recovery) = recovery();
        recovery.enable_logging(false);
        recovery.handle(CoreId::BOOT, &frame(ExceptionCause::BREAKPOINT));
        assert!(recovery.exception_log().is_empty());
    }

    fn paging_setup() -> (Arc<Mmu>, Arc<AddressSpace>, FaultRecovery) {
        let platform = Arc::new(SoftwarePlatform::new());
        let frames = Arc::new(FramePool::new(FrameNumber::new(0x8_0000), 32));
        let mmu = Arc::new(Mmu::new(MmuConfig::default(), frames, platform.clone()));
        let space = mmu.create_address_space().unwrap();
        let recovery = FaultRecovery::new(TrapConfig::default(), platform).with_mmu(mmu.clone());
        (mmu, space, recovery)
    }

    fn page_fault(space: &Arc<AddressSpace>, addr: usize) -> ExceptionFrame {
        ExceptionFrame::new(ExceptionCause::LOAD_PAGE_FAULT, VirtualAddress::new(0x1000), addr)
            .in_space(space.clone())
    }

    #[test]
    fn demand_pager_resolves_page_fault() {
        let (mmu, space, recovery) = paging_setup();
        let pager_mmu = mmu.clone();
        recovery.set_pager(
            move |space: &Arc<AddressSpace>, va: VirtualAddress, _access: Access| {
                let page = va.align_down(PAGE_SIZE);
                pager_mmu.map(
                    space,
                    page,
                    PhysicalAddress::new(0x20_0000),
                    PAGE_SIZE,
                    PageFlags::RW,
                    false,
                )
            },
        );

        let outcome = recovery.handle(CoreId::BOOT, &page_fault(&space, 0x5008));
        assert_eq!(outcome, DispatchOutcome::Resume);
        assert_eq!(
            mmu.walk(&space, VirtualAddress::new(0x5008)).map(|t| t.phys),
            Some(PhysicalAddress::new(0x20_0008))
        );
        assert_eq!(recovery.stats().class(FaultClass::PageFault).successes, 1);
    }

    #[test]
    fn already_mapped_page_resumes_without_pager() {
        let (mmu, space, recovery) = paging_setup();
        mmu.map(
            &space,
            VirtualAddress::new(0x5000),
            PhysicalAddress::new(0x20_0000),
            PAGE_SIZE,
            PageFlags::READ,
            false,
        )
        .unwrap();
        let outcome = recovery.handle(CoreId::BOOT, &page_fault(&space, 0x5000));
        assert_eq!(outcome, DispatchOutcome::Resume);
    }

    #[test]
    fn fault_in_destroyed_space_is_not_resolved_by_asid_successor() {
        let (mmu, space, recovery) = paging_setup();
        mmu.destroy_address_space(&space).unwrap();

        let successor = mmu.create_address_space().unwrap();
        assert_eq!(successor.asid(), space.asid());
        mmu.map(
            &successor,
            VirtualAddress::new(0x5000),
            PhysicalAddress::new(0x20_0000),
            PAGE_SIZE,
            PageFlags::RW,
            false,
        )
        .unwrap();
        mmu.translate(CoreId::BOOT, &successor, VirtualAddress::new(0x5000), Access::read())
            .unwrap();

        let outcome = recovery.handle(CoreId::BOOT, &page_fault(&space, 0x5000));
        assert_eq!(outcome, DispatchOutcome::Escalated(Severity::High));
        assert_eq!(recovery.stats().class(FaultClass::PageFault).failures, 1);
    }

    #[test]
    fn pager_that_maps_nothing_fails() {
        let (_mmu, space, recovery) = paging_setup();
        recovery.set_pager(|_: &Arc<AddressSpace>, _: VirtualAddress, _: Access| Ok(()));
        let outcome = recovery.handle(CoreId::BOOT, &page_fault(&space, 0x9000));
        assert_eq!(outcome, DispatchOutcome::Escalated(Severity::High));
        assert_eq!(recovery.stats().class(FaultClass::PageFault).failures, 1);
    }

    #[test]
    fn page_fault_without_space_fails() {
        let (_mmu, _space, recovery) = paging_setup();
        let frame = frame(ExceptionCause::STORE_PAGE_FAULT);
        assert_eq!(
            recovery.handle(CoreId::BOOT, &frame),
            DispatchOutcome::Escalated(Severity::High)
        );
    }
}
