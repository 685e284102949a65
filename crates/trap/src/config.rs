//! Severity ladder and trap layer configuration.

use core::fmt;

use crate::FaultClass;

/// How serious an exception is. Ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Logged, execution resumes.
    Low = 1,
    /// Recovery is attempted; failure escalates to `High`.
    Medium = 2,
    /// Recovery is attempted; failure escalates to `Critical`.
    High = 3,
    /// The system stops.
    Critical = 4,
}

impl Severity {
    /// Returns the next rung of the ladder. `Critical` stays `Critical`.
    pub const fn escalate(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Configuration of the fault recovery coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapConfig {
    /// Number of records the exception log keeps before overwriting the oldest.
    pub exception_log_capacity: usize,
    /// Severity of each fault class, indexed by [`FaultClass::index`].
    pub severities: [Severity; FaultClass::COUNT],
}

impl TrapConfig {
    pub fn severity(&self, class: FaultClass) -> Severity {
        self.severities[class.index()]
    }

    pub fn with_severity(mut self, class: FaultClass, severity: Severity) -> Self {
        self.severities[class.index()] = severity;
        self
    }
}

impl Default for TrapConfig {
    fn default() -> Self {
        let mut severities = [Severity::High; FaultClass::COUNT];
        severities[FaultClass::Misaligned.index()] = Severity::Medium;
        severities[FaultClass::PageFault.index()] = Severity::Medium;
        severities[FaultClass::Breakpoint.index()] = Severity::Low;
        Self {
            exception_log_capacity: 64,
            severities,
        }
    }
}
