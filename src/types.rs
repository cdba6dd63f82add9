//! Basic type definitions used throughout the mesh node, including
//! node identifiers, session ids and the upward delivery callback.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the mesh. Wrapping a `String` allows
/// strong typing rather than using raw strings everywhere.
///
/// Provides convenience conversions and display formatting.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new `NodeId` from any type convertible to `String`.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stable identifier for one peer session, assigned from a monotonic
/// counter in accept/connect order. Keying the peer map by `SessionId`
/// keeps iteration in that order and makes prune-while-iterating safe.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Upward delivery sink installed via `MeshNode::on_message`. Invoked
/// from the inbound dispatcher task with the verbatim received line.
/// Shared so delivery never holds the handler slot's lock.
pub type MessageHandler = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Milliseconds since the Unix epoch, as carried in `WireMsg::timestamp`
/// and `StoredMessage::timestamp`. The wire type is signed 64-bit.
pub fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
