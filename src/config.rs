//! Configuration constants and runtime parameters for the mesh node.

use crate::error::MeshError;

/// Default hop budget stamped into locally-produced messages by hosts
/// that do not choose their own. A message with `ttl == 0` is terminal.
pub const DEFAULT_TTL: i32 = 6;

/// Reserved `type` tag carried by heartbeat frames.
pub const PING_TYPE: &str = "ping";

/// User-tunable parameters that control timing, buffering and behavior
/// of the mesh node.
///
/// Fields are grouped by purpose to make it easier to configure and
/// validate.
#[derive(Clone, Copy, Debug)]
pub struct MeshConfig {
    // --- heartbeats --------------------------------------------------------
    /// interval (ms) between heartbeat ping broadcasts and peer sweeps
    pub heartbeat_interval_ms: u64,
    /// number of consecutive sweeps without inbound activity after
    /// which a peer session is closed
    pub missed_heartbeat_limit: u32,

    // --- dedup -------------------------------------------------------------
    /// bound on the set of already-processed `msg_id`s; the oldest ids
    /// are evicted in insertion order once the bound is reached
    pub seen_cache_capacity: usize,

    // --- buffers & capacities ----------------------------------------------
    /// capacity of each peer's outgoing send queue; frames enqueued
    /// beyond it are dropped for that peer
    pub send_queue_capacity: usize,
    /// maximum number of simultaneous peer sessions
    pub max_connections: usize,
    /// maximum length (bytes) of a single wire line, terminator included
    pub max_line_length: usize,

    // --- timeouts ----------------------------------------------------------
    /// timeout (ms) per candidate endpoint when dialing a peer
    pub connect_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2000,
            missed_heartbeat_limit: 3,
            seen_cache_capacity: 8192,
            send_queue_capacity: 128,
            max_connections: 64,
            max_line_length: 256 * 1024,
            connect_timeout_ms: 5000,
        }
    }
}

impl MeshConfig {
    /// Ensure that the configuration values make sense; returns an
    /// error describing the first invalid field encountered.
    pub fn validate(&self) -> Result<(), MeshError> {
        let e = |msg: &str| Err(MeshError::InvalidArgument(msg.into()));

        if self.heartbeat_interval_ms == 0 {
            return e("heartbeat_interval_ms must be > 0");
        }
        if self.missed_heartbeat_limit == 0 {
            return e("missed_heartbeat_limit must be > 0");
        }
        if self.seen_cache_capacity == 0 {
            return e("seen_cache_capacity must be > 0");
        }
        if self.send_queue_capacity == 0 {
            return e("send_queue_capacity must be > 0");
        }
        if self.max_connections == 0 {
            return e("max_connections must be > 0");
        }
        if self.max_line_length < 2 {
            return e("max_line_length must hold at least one byte plus the terminator");
        }
        if self.connect_timeout_ms == 0 {
            return e("connect_timeout_ms must be > 0");
        }

        Ok(())
    }
}
