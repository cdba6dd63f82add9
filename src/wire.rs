//! The canonical message envelope and the classification of inbound
//! wire lines.
//!
//! Every frame on the wire is one JSON value per `'\n'`-terminated
//! line. Frames carrying a `msg_id` key must decode to the full
//! [`WireMsg`] envelope and participate in dedup and TTL handling;
//! frames without one are opaque to the mesh and handed to the upper
//! layer untouched.

use serde::{Deserialize, Serialize};

use crate::config::PING_TYPE;
use crate::error::MeshError;
use crate::types::NodeId;

/// The on-wire envelope. Producer-chosen `msg_id` values must be
/// globally unique across the mesh; a collision is indistinguishable
/// from a duplicate and the message is suppressed.
///
/// `priority`, `chunk_index` and `chunk_total` carry no semantics here
/// and are preserved verbatim when a message is forwarded.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WireMsg {
    pub msg_id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub sender: String,
    #[serde(default)]
    pub priority: i32,
    /// milliseconds since the Unix epoch at the origin
    pub timestamp: i64,
    /// hop budget; `0` is terminal and never rebroadcast
    pub ttl: i32,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub chunk_index: i32,
    #[serde(default)]
    pub chunk_total: i32,
}

impl WireMsg {
    /// Build a heartbeat frame. Pings are ordinary envelopes with
    /// `ttl = 0`, so receivers record them in their seen-set and
    /// deliver them upward but never forward them.
    pub fn ping(node_id: &NodeId, seq: u64, timestamp: i64) -> Self {
        Self {
            msg_id: format!("{node_id}-ping-{seq}"),
            msg_type: PING_TYPE.to_owned(),
            sender: node_id.as_str().to_owned(),
            priority: 0,
            timestamp,
            ttl: 0,
            content: String::new(),
            chunk_index: 0,
            chunk_total: 0,
        }
    }

    /// Serialize the envelope to its single-line wire form (without
    /// the `'\n'` terminator; the codec appends it).
    pub fn to_line(&self) -> Result<String, MeshError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outcome of classifying one inbound line.
#[derive(Debug)]
pub enum InboundFrame {
    /// A full envelope; subject to dedup and TTL handling.
    Message(WireMsg),
    /// Valid JSON without a `msg_id` key; passed upward verbatim,
    /// bypassing dedup and TTL.
    Opaque,
}

/// Classify one inbound line.
///
/// Invalid JSON and envelopes with missing or mistyped required fields
/// are errors (the caller logs and drops the frame, keeping the
/// session open). The `msg_id` probe uses `Value::get`, which returns
/// `None` for non-object values, so arrays and scalars fall into the
/// opaque pass-through path.
pub fn classify(line: &str) -> Result<InboundFrame, MeshError> {
    let value: serde_json::Value = serde_json::from_str(line)?;

    if value.get("msg_id").is_none() {
        return Ok(InboundFrame::Opaque);
    }

    let msg: WireMsg = serde_json::from_value(value)?;
    if msg.msg_id.is_empty() {
        return Err(MeshError::MalformedEnvelope("msg_id is empty".into()));
    }

    Ok(InboundFrame::Message(msg))
}
