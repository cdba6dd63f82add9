//! Error types used throughout the mesh node.

use std::fmt;
use std::io;

/// Rich error type used within the crate. Each variant corresponds to a
/// particular failure mode; many are parameterized with details for
/// diagnostics.
///
/// All protocol- and session-level failures are recovered where they
/// occur (frame dropped or session closed); the only errors that reach
/// the host are construction and connect failures.
#[derive(Debug)]
pub enum MeshError {
    // --- argument/validation ---------------------------------------------
    InvalidArgument(String),

    // --- I/O and connection-level errors ---------------------------------
    Io(io::Error),
    ConnectFailed(String),
    ConnectTimeout,
    MaxConnectionsReached,

    // --- framing ----------------------------------------------------------
    LineTooLong(usize),
    InvalidUtf8,

    // --- protocol ---------------------------------------------------------
    Parse(serde_json::Error),
    MalformedEnvelope(String),

    // --- messaging --------------------------------------------------------
    SendQueueFull,
    SessionClosed,
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
            Self::ConnectFailed(msg) => write!(f, "connect failed: {msg}"),
            Self::ConnectTimeout => write!(f, "connect timeout"),
            Self::MaxConnectionsReached => write!(f, "max connections reached"),
            Self::LineTooLong(len) => write!(f, "line too long: {len} bytes"),
            Self::InvalidUtf8 => write!(f, "frame is not valid UTF-8"),
            Self::Parse(e) => write!(f, "parse error: {e}"),
            Self::MalformedEnvelope(msg) => write!(f, "malformed envelope: {msg}"),
            Self::SendQueueFull => write!(f, "send queue full"),
            Self::SessionClosed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for MeshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MeshError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}
