//! Adapter between an external request source (an HTTP handler, an IPC
//! endpoint, a UI thread) and the mesh.
//!
//! Outbound: [`Bridge::handle_send`] stamps the current timestamp into
//! the producer's JSON body, records it in the shared [`RingBuffer`]
//! and floods it to the peers. Inbound: [`Bridge::handle_recv`] answers
//! "everything observed since T" from the ring. Both ends may run on
//! threads other than the runtime's; the ring's mutex and the node's
//! lock-guarded state make that safe.

use std::sync::Arc;

use crate::history::RingBuffer;
use crate::types::current_timestamp_ms;
use crate::MeshNode;

pub struct Bridge {
    node: Arc<MeshNode>,
    history: Arc<RingBuffer>,
}

impl Bridge {
    pub fn new(node: Arc<MeshNode>, history: Arc<RingBuffer>) -> Self {
        Self { node, history }
    }

    /// Accept an externally-produced message body. Parses `body` as a
    /// JSON object, stamps `timestamp` with the current wall clock,
    /// records the stamped serialization in the history ring and
    /// broadcasts it to all peers.
    ///
    /// Anything that is not a JSON object is discarded: the producer
    /// is local and is expected to fix its input.
    pub fn handle_send(&self, body: &str) {
        let Ok(mut value) = serde_json::from_str::<serde_json::Value>(body) else {
            tracing::debug!("bridge send discarded: body is not valid JSON");
            return;
        };
        let Some(object) = value.as_object_mut() else {
            tracing::debug!("bridge send discarded: body is not a JSON object");
            return;
        };

        let ts = current_timestamp_ms();
        object.insert("timestamp".to_owned(), ts.into());

        let text = value.to_string();
        self.history.push(ts, text.as_str());
        self.node.broadcast(&text);
    }

    /// Collect every stored message newer than `since_ts` (strict) as
    /// a serialized JSON array, oldest first. Entries that still parse
    /// are embedded as JSON values; anything else is embedded as the
    /// raw string.
    pub fn handle_recv(&self, since_ts: i64) -> String {
        let entries = self.history.get_since(since_ts);
        let items: Vec<serde_json::Value> = entries
            .into_iter()
            .map(|m| {
                serde_json::from_str(&m.json_text)
                    .unwrap_or(serde_json::Value::String(m.json_text))
            })
            .collect();
        serde_json::Value::Array(items).to_string()
    }

    /// Reserved for a host-provided HTTP/IPC front end. No-op.
    pub fn start_server(&self) {}
}
