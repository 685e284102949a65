//! Interrupt source state, priorities and nesting.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Reverse;

use mmu::Platform;
use spin::Mutex;

use crate::{DispatchError, INTERRUPT_COUNT, InterruptHandler};

/// Where an interrupt source is in its life cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptState {
    /// Masked. A signal is latched and shows up once the source is enabled.
    Disabled,
    Idle,
    /// Signalled and waiting to be serviced.
    Pending,
    /// Dispatched and not yet acknowledged.
    InService,
}

#[derive(Default)]
struct Line {
    handler: Option<Arc<dyn InterruptHandler>>,
    enabled: bool,
    latched: bool,
    in_service: bool,
    priority: u32,
}

impl Line {
    fn state(&self) -> InterruptState {
        if !self.enabled {
            InterruptState::Disabled
        } else if self.in_service {
            InterruptState::InService
        } else if self.latched {
            InterruptState::Pending
        } else {
            InterruptState::Idle
        }
    }
}

struct Running {
    source: usize,
    priority: u32,
    nesting: bool,
}

struct Lines {
    lines: Vec<Line>,
    /// Handlers currently running on this core, innermost last.
    running: Vec<Running>,
}

/// Whether a dispatched interrupt may run its handler.
pub(crate) enum Admission {
    Run(Arc<dyn InterruptHandler>, u32),
    /// Disabled or without a handler.
    Spurious,
    /// Latched until the running handler lets it through.
    Deferred,
}

/// The interrupt sources of one core.
pub struct InterruptTable {
    inner: Mutex<Lines>,
}

impl InterruptTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Lines {
                lines: (0..INTERRUPT_COUNT).map(|_| Line::default()).collect(),
                running: Vec::new(),
            }),
        }
    }

    fn with_line<R>(
        &self,
        source: usize,
        f: impl FnOnce(&mut Line) -> R,
    ) -> Result<R, DispatchError> {
        let mut inner = self.inner.lock();
        let line = inner
            .lines
            .get_mut(source)
            .ok_or(DispatchError::UnknownTrapNumber)?;
        Ok(f(line))
    }

    pub(crate) fn set_handler(
        &self,
        source: usize,
        handler: Option<Arc<dyn InterruptHandler>>,
    ) -> Result<(), DispatchError> {
        self.with_line(source, |line| line.handler = handler)
    }

    pub fn is_registered(&self, source: usize) -> bool {
        self.with_line(source, |line| line.handler.is_some())
            .unwrap_or(false)
    }

    /// Unmasks `source`. A signal latched while masked becomes pending.
    pub fn enable(&self, source: usize) -> Result<(), DispatchError> {
        self.with_line(source, |line| line.enabled = true)
    }

    /// Masks `source`. Its latched signal, if any, is kept.
    pub fn disable(&self, source: usize) -> Result<(), DispatchError> {
        self.with_line(source, |line| line.enabled = false)
    }

    pub fn set_priority(&self, source: usize, priority: u32) -> Result<(), DispatchError> {
        self.with_line(source, |line| line.priority = priority)
    }

    pub fn priority(&self, source: usize) -> Option<u32> {
        self.with_line(source, |line| line.priority).ok()
    }

    /// Latches a signal on `source`, masked or not.
    pub fn raise(&self, source: usize) -> Result<(), DispatchError> {
        self.with_line(source, |line| line.latched = true)
    }

    /// Ends service of `source`, returning it to idle.
    pub fn acknowledge(&self, source: usize) -> Result<(), DispatchError> {
        self.with_line(source, |line| line.in_service = false)
    }

    pub fn state(&self, source: usize) -> Option<InterruptState> {
        self.with_line(source, |line| line.state()).ok()
    }

    /// Returns the pending source to service next: the highest priority,
    /// ties going to the lowest source number.
    pub fn highest_priority_pending(&self) -> Option<usize> {
        let inner = self.inner.lock();
        inner
            .lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.state() == InterruptState::Pending)
            .max_by_key(|&(source, line)| (line.priority, Reverse(source)))
            .map(|(source, _)| source)
    }

    /// Latches every source the platform reports as both pending and enabled.
    /// Returns the number of sources latched.
    pub fn latch_from_platform(&self, platform: &dyn Platform) -> usize {
        let mut inner = self.inner.lock();
        let mut latched = 0;
        for word in 0..INTERRUPT_COUNT / 64 {
            let mut mask = platform.read_pending_interrupt_mask(word)
                & platform.read_enabled_interrupt_mask(word);
            while mask != 0 {
                let bit = mask.trailing_zeros() as usize;
                mask &= mask - 1;
                inner.lines[word * 64 + bit].latched = true;
                latched += 1;
            }
        }
        latched
    }

    /// Number of handlers running on this core.
    pub fn nesting_depth(&self) -> usize {
        self.inner.lock().running.len()
    }

    pub(crate) fn allow_nesting(&self, source: usize) {
        let mut inner = self.inner.lock();
        if let Some(running) = inner.running.iter_mut().rev().find(|r| r.source == source) {
            running.nesting = true;
        }
    }

    /// Decides whether `source` may run now and, if so, marks it in service.
    pub(crate) fn admit(&self, source: usize) -> Result<Admission, DispatchError> {
        let mut inner = self.inner.lock();
        let preemptible_below = inner
            .running
            .last()
            .map(|top| top.nesting.then_some(top.priority));
        let line = inner
            .lines
            .get_mut(source)
            .ok_or(DispatchError::UnknownTrapNumber)?;

        if !line.enabled {
            line.latched = true;
            return Ok(Admission::Spurious);
        }
        let Some(handler) = line.handler.clone() else {
            line.latched = false;
            return Ok(Admission::Spurious);
        };
        let blocked = match preemptible_below {
            None => false,
            Some(None) => true,
            Some(Some(running)) => line.priority <= running,
        };
        if line.in_service || blocked {
            line.latched = true;
            return Ok(Admission::Deferred);
        }

        line.latched = false;
        line.in_service = true;
        let priority = line.priority;
        inner.running.push(Running {
            source,
            priority,
            nesting: false,
        });
        Ok(Admission::Run(handler, priority))
    }

    /// Called once the handler admitted for `source` has returned.
    pub(crate) fn finish(&self, source: usize) {
        let mut inner = self.inner.lock();
        if let Some(position) = inner.running.iter().rposition(|r| r.source == source) {
            inner.running.remove(position);
        }
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use mmu::SoftwarePlatform;

    use super::*;
    use crate::InterruptContext;

    fn noop() -> Option<Arc<dyn InterruptHandler>> {
        Some(Arc::new(|_: &InterruptContext<'_>| {}))
    }

    #[test]
    fn state_machine() {
        let table = InterruptTable::new();
        table.set_handler(4, noop()).unwrap();
        assert_eq!(table.state(4), Some(InterruptState::Disabled));

        table.enable(4).unwrap();
        assert_eq!(table.state(4), Some(InterruptState::Idle));
        table.raise(4).unwrap();
        assert_eq!(table.state(4), Some(InterruptState::Pending));

        assert!(matches!(table.admit(4), Ok(Admission::Run(_, 0))));
        assert_eq!(table.state(4), Some(InterruptState::InService));
        table.finish(4);
        assert_eq!(table.state(4), Some(InterruptState::InService));

        table.acknowledge(4).unwrap();
        assert_eq!(table.state(4), Some(InterruptState::Idle));
    }

    #[test]
    fn latched_while_disabled_becomes_pending() {
        let table = InterruptTable::new();
        table.raise(9).unwrap();
        assert_eq!(table.state(9), Some(InterruptState::Disabled));
        assert_eq!(table.highest_priority_pending(), None);

        table.enable(9).unwrap();
        assert_eq!(table.state(9), Some(InterruptState::Pending));
        assert_eq!(table.highest_priority_pending(), Some(9));
    }

    #[test]
    fn priority_resolution() {
        let table = InterruptTable::new();
        for (source, priority) in [(3, 5), (7, 9), (12, 9)] {
            table.enable(source).unwrap();
            table.set_priority(source, priority).unwrap();
            table.raise(source).unwrap();
        }
        assert_eq!(table.highest_priority_pending(), Some(7));
    }

    #[test]
    fn out_of_range_sources() {
        let table = InterruptTable::new();
        assert_eq!(table.enable(INTERRUPT_COUNT), Err(DispatchError::UnknownTrapNumber));
        assert_eq!(table.state(INTERRUPT_COUNT), None);
        assert!(table.admit(INTERRUPT_COUNT).is_err());
    }

    #[test]
    fn nesting_requires_opt_in_and_higher_priority() {
        let table = InterruptTable::new();
        for (source, priority) in [(1, 5), (2, 5), (3, 8)] {
            table.set_handler(source, noop()).unwrap();
            table.set_priority(source, priority).unwrap();
            table.enable(source).unwrap();
        }

        assert!(matches!(table.admit(1), Ok(Admission::Run(..))));
        assert!(matches!(table.admit(3), Ok(Admission::Deferred)));
        assert_eq!(table.state(3), Some(InterruptState::Pending));

        table.allow_nesting(1);
        assert!(matches!(table.admit(2), Ok(Admission::Deferred)));
        assert!(matches!(table.admit(3), Ok(Admission::Run(_, 8))));
        assert_eq!(table.nesting_depth(), 2);

        table.finish(3);
        table.finish(1);
        assert_eq!(table.nesting_depth(), 0);
    }

    #[test]
    fn latch_from_platform_uses_both_masks() {
        let platform = SoftwarePlatform::new();
        platform.set_pending(70, true);
        platform.set_enabled(70, true);
        platform.set_pending(5, true);
        platform.set_enabled(900, true);

        let table = InterruptTable::new();
        table.enable(70).unwrap();
        table.enable(5).unwrap();
        assert_eq!(table.latch_from_platform(&platform), 1);
        assert_eq!(table.state(70), Some(InterruptState::Pending));
        assert_eq!(table.state(5), Some(InterruptState::Idle));
    }
}
