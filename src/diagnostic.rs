use std::fmt::Display;

use serde::Serialize;

use crate::addr::Addr;
use crate::errors::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Alert,
}

/// Human readable reports of things that went wrong during a refresh
///
/// Each kind says what probably happened and what to do about it, instead of exposing the
/// internal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum Diagnostic {
    ConnectionFailed,
    TargetBusy,
    NoTarget,
    SyncFailed(String),
    /// The process or its stack mapping could not be found
    NoMemory(String),
    /// A named region is absent, its display is skipped
    NoMemoryRegion(String),
    ReadFailure(String),
    ReturnAddressUnresolved(Addr),
    AmbiguousReturn { chosen: Addr, candidates: Vec<Addr> },
    UnresolvedFunction(Addr),
    NoMainFunction,
    ExecutionFailed(String),
}

impl Diagnostic {
    /// The diagnostic for a failed fetch of the given kind
    pub fn for_failure(kind: FailureKind, detail: impl Display) -> Self {
        match kind {
            FailureKind::Busy => Diagnostic::TargetBusy,
            FailureKind::NoTarget => Diagnostic::NoTarget,
            FailureKind::ConnectionFailed => Diagnostic::ConnectionFailed,
            FailureKind::Unknown => Diagnostic::SyncFailed(detail.to_string()),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Diagnostic::TargetBusy
            | Diagnostic::NoMemoryRegion(_)
            | Diagnostic::UnresolvedFunction(_) => Severity::Info,
            Diagnostic::AmbiguousReturn { .. }
            | Diagnostic::ReadFailure(_)
            | Diagnostic::ReturnAddressUnresolved(_) => Severity::Warning,
            Diagnostic::ConnectionFailed
            | Diagnostic::NoTarget
            | Diagnostic::SyncFailed(_)
            | Diagnostic::NoMemory(_)
            | Diagnostic::NoMainFunction
            | Diagnostic::ExecutionFailed(_) => Severity::Alert,
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::ConnectionFailed => write!(
                f,
                "Could not sync with the debugger backend. Start it and try again."
            )?,
            Diagnostic::TargetBusy => write!(
                f,
                "The target is busy, possibly awaiting input from you. The register state could not be retrieved, the view refreshes once it stops."
            )?,
            Diagnostic::NoTarget => write!(
                f,
                "Couldn't get the register state. The process may not be running."
            )?,
            Diagnostic::SyncFailed(detail) => write!(
                f,
                "Couldn't get the register state ({detail}). Did you run the binary yet?"
            )?,
            Diagnostic::NoMemory(what) => write!(f, "No memory returned: {what}")?,
            Diagnostic::NoMemoryRegion(name) => {
                write!(f, "The binary has no {name} region, skipping it")?
            }
            Diagnostic::ReadFailure(what) => write!(f, "Could not read memory: {what}")?,
            Diagnostic::ReturnAddressUnresolved(at) => write!(
                f,
                "Return address resolution failed: {at} is outside the stack window. The stack is probably not set up yet, carry on."
            )?,
            Diagnostic::AmbiguousReturn { chosen, candidates } => write!(
                f,
                "The function has {} possible return address locations, showing the first one at {chosen}",
                candidates.len()
            )?,
            Diagnostic::UnresolvedFunction(ip) => write!(
                f,
                "No known function contains {ip}, assuming a conventional frame for the return address"
            )?,
            Diagnostic::NoMainFunction => {
                write!(f, "No main function found, so no breakpoints were set")?
            }
            Diagnostic::ExecutionFailed(detail) => write!(f, "Execution control failed: {detail}")?,
        }

        Ok(())
    }
}
