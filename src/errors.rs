//! # Error Types
//!
//! The crate wide error type and the classification of failures that reach the live backend.

use serde::Serialize;
use thiserror::Error;

use crate::addr::Addr;

pub type Result<T> = std::result::Result<T, LiveError>;

#[derive(Error, Debug)]
pub enum LiveError {
    #[error("Os error: {0}")]
    Os(#[from] nix::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not parse object file: {0}")]
    Object(#[from] object::Error),
    #[error("Could not (de)serialize json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not convert to CString: {0}")]
    CStringConv(#[from] std::ffi::NulError),
    #[error("Could not parse integer: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    #[cfg(feature = "cli")]
    #[error("Error with the command line prompt: {0}")]
    Dialoguer(#[from] dialoguer::Error),

    #[error("Could not connect to the live backend")]
    ConnectionFailed,
    #[error("The target is busy")]
    Busy,
    #[error("No such target")]
    NoTarget,
    #[error("Unclassified backend failure: {0}")]
    Unknown(String),

    #[error("No memory region named '{0}'")]
    NoMemoryRegion(String),
    #[error("Could only read {got} of {wanted} bytes at {addr}")]
    ReadFailure {
        addr: Addr,
        wanted: usize,
        got: usize,
    },
    #[error("The backend did not report the register '{0}'")]
    MissingRegister(String),

    #[error("Architecture not supported: {0}")]
    UnsupportedArchitecture(String),
    #[error("Executable does not exist: {0}")]
    ExecutableDoesNotExist(String),
    #[error("Executable is not a file: {0}")]
    ExecutableIsNotAFile(String),
    #[error("Tried to enable breakpoint again")]
    BreakpointIsAlreadyEnabled,
    #[error("Tried to disable breakpoint again")]
    BreakpointIsAlreadyDisabled,
    #[error("Could not parse command: {0}")]
    ParseCommand(String),
}

/// Classification of a failed interaction with the live backend
///
/// Only these kinds take part in the retry bookkeeping of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The backend itself could not be reached
    ConnectionFailed,
    /// The target exists but does not answer, most likely blocked in a syscall
    Busy,
    /// There is no live process
    NoTarget,
    /// Anything else
    Unknown,
}

impl LiveError {
    /// Maps this error onto the failure taxonomy of the sync layer
    ///
    /// Returns `None` for errors that are local to one fetch step, like a short read or a
    /// missing memory region. Those never schedule a retry.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            LiveError::ConnectionFailed => Some(FailureKind::ConnectionFailed),
            LiveError::Busy => Some(FailureKind::Busy),
            LiveError::NoTarget => Some(FailureKind::NoTarget),
            LiveError::ReadFailure { .. } | LiveError::NoMemoryRegion(_) => None,
            _ => Some(FailureKind::Unknown),
        }
    }
}
