//! Platform implementations.
//!
//! The x86_64 implementation drives the real hardware; the software one
//! records every call so hosted runs and tests can observe barriers,
//! invalidations and halts.

// NOTE: We DO include the x86_64 module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::X86Platform;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::{PlatformCall, SoftwarePlatform};
