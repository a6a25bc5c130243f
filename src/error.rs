//! Error types shared by the daemon, the RPC client and the console proxy
//!
//! Transport-level failures (`Protocol`, `ConnectionLost`, `Io`) end the
//! connection they happened on. Everything else is reported to the caller as
//! a fault and the connection stays usable.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the webspace transport and console layers
#[derive(Debug, Error)]
pub enum Error {
    /// A frame could not be decoded (bad length, truncated payload, bad JSON)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The method name is not registered on the server
    #[error("No such method: {0}")]
    NoSuchMethod(String),

    /// The remote operation failed; carries the daemon's message
    #[error("{0}")]
    Remote(String),

    /// The server socket could not be created
    #[error("Failed to bind {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A console operation was issued at the wrong session stage
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The peer closed the stream
    #[error("Connection lost")]
    ConnectionLost,

    /// A handler was called with arguments of the wrong shape
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The container backend refused or failed an operation
    #[error("{0}")]
    Backend(String),

    /// I/O error on a socket or terminal
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a backend failure with a formatted message
    pub fn backend(message: impl Into<String>) -> Self {
        Error::Backend(message.into())
    }

    /// Map this error onto the fault sent back to the caller
    pub fn to_fault(&self) -> Fault {
        let kind = match self {
            Error::NoSuchMethod(_) => FaultKind::NoSuchMethod,
            Error::InvalidState(_) => FaultKind::InvalidState,
            Error::InvalidArgument(_) => FaultKind::InvalidArgument,
            Error::Protocol(_) => FaultKind::Protocol,
            _ => FaultKind::Remote,
        };
        let message = match self {
            Error::NoSuchMethod(name) => name.clone(),
            Error::InvalidState(msg) | Error::InvalidArgument(msg) | Error::Protocol(msg) => {
                msg.clone()
            }
            other => other.to_string(),
        };
        Fault { kind, message }
    }
}

/// Category of a fault reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    NoSuchMethod,
    Remote,
    InvalidState,
    InvalidArgument,
    Protocol,
}

/// Fault descriptor carried by a failed reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        match fault.kind {
            FaultKind::NoSuchMethod => Error::NoSuchMethod(fault.message),
            FaultKind::InvalidState => Error::InvalidState(fault.message),
            FaultKind::InvalidArgument => Error::InvalidArgument(fault.message),
            FaultKind::Protocol => Error::Protocol(fault.message),
            FaultKind::Remote => Error::Remote(fault.message),
        }
    }
}
