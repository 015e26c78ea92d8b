//! Crate-wide error types.
//!
//! The core distinguishes three failure kinds (see the module design notes):
//! fatal errors abort the process, per-compile errors produce a trap block
//! instead of real code, and per-op errors are delivered to the guest as a
//! signal. Only the first two are represented here as a `DbtError`; per-op
//! faults are raised as host signals at runtime and are not part of this
//! enum (see `runtime::GuestSignal`).

use std::fmt;

use crate::runtime::GuestSignal;

/// Something that made the whole JIT unusable: the caller should log and
/// abort rather than attempt to continue.
#[derive(Debug)]
pub enum DbtError {
    /// Arena exhaustion, code-buffer `mmap` failure, or an IR invariant
    /// violation caught by a validation pass.
    Fatal(String),
    /// An undecodable instruction or unmapped guest page encountered while
    /// compiling a block. The caller should install a trap block instead of
    /// propagating this further.
    PerCompile { pc: u64, reason: String },
    /// A guest-visible fault (divide by zero, unmapped memory access) that
    /// must be reflected to the guest as a signal.
    PerOp(GuestSignal),
}

impl fmt::Display for DbtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbtError::Fatal(msg) => write!(f, "fatal: {}", msg),
            DbtError::PerCompile { pc, reason } => {
                write!(f, "compile failed at {:#x}: {}", pc, reason)
            }
            DbtError::PerOp(sig) => write!(f, "guest fault: {:?}", sig),
        }
    }
}

impl std::error::Error for DbtError {}

/// Log the message through the `log` shim, then abort.
///
/// Mirrors `LogMan::Msg::ERROR_AND_DIE`: a fatal condition is always logged
/// before the process goes down, so the last line on stderr explains why.
pub fn log_and_trap(err: &DbtError) -> ! {
    crate::dbg_e!("{}", err);
    std::process::abort();
}

pub type Result<T> = std::result::Result<T, DbtError>;
