//! Peer-to-peer mesh messaging node.
//!
//! Each [`MeshNode`] listens on a TCP port, accepts inbound peer
//! connections, may dial out to other nodes, and floods line-framed
//! JSON messages across the mesh. A bounded dedup set and a per-message
//! TTL keep flooded traffic from circulating forever; a periodic
//! heartbeat keeps sessions honest and sweeps dead ones. The
//! [`Bridge`] pairs a node with a [`RingBuffer`] so a co-located
//! consumer can inject messages and poll recent traffic by timestamp.

mod bridge;
mod config;
mod dedup;
mod error;
mod history;
mod session;
mod types;
mod wire;

pub use bridge::Bridge;
pub use config::{MeshConfig, DEFAULT_TTL, PING_TYPE};
pub use error::MeshError;
pub use history::{RingBuffer, StoredMessage};
pub use session::{LineCodec, Session};
pub use types::{current_timestamp_ms, MessageHandler, NodeId, SessionId};
pub use wire::{classify, InboundFrame, WireMsg};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::dedup::SeenSet;
use crate::session::{configure_keepalive, LineCodec as Codec};

/// One node in the mesh: the acceptor, the peer set, the seen-id set
/// and the heartbeat, plus the flood/dedup/TTL protocol core in
/// [`MeshNode::handle_line`].
///
/// All state is lock-guarded, so `broadcast` and the `Bridge` entry
/// points are safe to call from threads other than the runtime's.
pub struct MeshNode {
    node_id: NodeId,
    config: MeshConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    peers: RwLock<BTreeMap<SessionId, Arc<Session>>>,
    seen_ids: Mutex<SeenSet>,
    message_handler: RwLock<Option<MessageHandler>>,
    incoming_tx: mpsc::Sender<(SessionId, String)>,
    incoming_rx: Mutex<Option<mpsc::Receiver<(SessionId, String)>>>,
    next_session_id: AtomicU64,
    ping_seq: AtomicU64,
    started: AtomicBool,
    shutdown_token: CancellationToken,
}

impl MeshNode {
    /// Bind the acceptor to `0.0.0.0:listen_port` (IPv4; port 0 picks
    /// an ephemeral port, see [`MeshNode::local_addr`]). The node does
    /// nothing until [`MeshNode::start`] is called.
    pub async fn new(
        listen_port: u16,
        node_id: NodeId,
        config: MeshConfig,
    ) -> Result<Arc<Self>, MeshError> {
        config.validate()?;

        let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(node = %node_id, addr = %local_addr, "TCP listener bound");

        let (incoming_tx, incoming_rx) = mpsc::channel(256);

        Ok(Arc::new(Self {
            node_id,
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            peers: RwLock::new(BTreeMap::new()),
            seen_ids: Mutex::new(SeenSet::new(config.seen_cache_capacity)),
            message_handler: RwLock::new(None),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            next_session_id: AtomicU64::new(1),
            ping_seq: AtomicU64::new(1),
            started: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
        }))
    }

    /// Begin accepting peers, dispatching inbound lines and sending
    /// heartbeats. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let listener = self
            .listener
            .lock()
            .take()
            .expect("listener present until first start");
        let incoming_rx = self
            .incoming_rx
            .lock()
            .take()
            .expect("dispatcher receiver present until first start");

        self.spawn_accept_loop(listener);
        self.spawn_line_dispatcher(incoming_rx);
        self.spawn_heartbeat();
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The bound listener address; the port is the one to hand to
    /// other nodes' `connect_to_peer`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Install the upward delivery callback; last write wins. The
    /// handler runs on the inbound dispatcher task with the verbatim
    /// received line.
    pub fn on_message(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        *self.message_handler.write() = Some(Arc::new(handler));
    }

    /// Dial a peer. Resolves `host` and tries each candidate endpoint
    /// in order, `connect_timeout_ms` apiece; the first that connects
    /// becomes a started session. Failures are logged and returned; no
    /// retry is scheduled.
    pub async fn connect_to_peer(
        self: &Arc<Self>,
        host: &str,
        port: u16,
    ) -> Result<SessionId, MeshError> {
        if self.peers.read().len() >= self.config.max_connections {
            tracing::warn!(host, port, "connect rejected: max connections reached");
            return Err(MeshError::MaxConnectionsReached);
        }

        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| {
                tracing::warn!(host, port, error = %e, "resolve failed");
                MeshError::ConnectFailed(format!("resolve {host}:{port}: {e}"))
            })?
            .collect();

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let mut last_err = MeshError::ConnectFailed(format!("{host}:{port}: no addresses"));

        for addr in candidates {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let id = self.register_session(stream, addr)?;
                    tracing::info!(node = %self.node_id, %addr, session = %id, "connected to peer");
                    return Ok(id);
                }
                Ok(Err(e)) => {
                    tracing::warn!(%addr, error = %e, "connect attempt failed");
                    last_err = MeshError::ConnectFailed(format!("{addr}: {e}"));
                }
                Err(_) => {
                    tracing::warn!(%addr, "connect attempt timed out");
                    last_err = MeshError::ConnectTimeout;
                }
            }
        }

        tracing::warn!(host, port, error = %last_err, "connect failed");
        Err(last_err)
    }

    /// Send `line` to every live peer, pruning dead sessions in the
    /// same pass. Frames a peer's full queue cannot take are dropped
    /// for that peer with a warning.
    pub fn broadcast(&self, line: &str) {
        self.broadcast_except(line, None);
    }

    fn broadcast_except(&self, line: &str, exclude: Option<SessionId>) {
        let mut peers = self.peers.write();
        peers.retain(|id, session| {
            if !session.alive() {
                return false;
            }
            if Some(*id) == exclude {
                return true;
            }
            if let Err(e) = session.deliver(line) {
                tracing::warn!(session = %id, error = %e, "frame dropped for peer");
            }
            session.alive()
        });
    }

    /// The protocol core, invoked by the dispatcher for every
    /// non-empty inbound line.
    ///
    /// Parse failures and malformed envelopes are logged and dropped
    /// (the session stays open). Valid JSON without a `msg_id` bypasses
    /// dedup and TTL and goes straight upward. A full envelope is
    /// delivered upward at most once per `msg_id`; a positive TTL is
    /// decremented and the re-serialized frame flooded to every peer
    /// except the one it arrived on.
    pub fn handle_line(&self, origin: SessionId, line: &str) {
        match wire::classify(line) {
            Err(e) => {
                tracing::warn!(session = %origin, error = %e, "dropping malformed frame");
            }
            Ok(InboundFrame::Opaque) => {
                self.deliver_upward(line);
            }
            Ok(InboundFrame::Message(mut msg)) => {
                if !self.seen_ids.lock().insert(&msg.msg_id) {
                    tracing::debug!(msg_id = %msg.msg_id, "duplicate suppressed");
                    return;
                }

                if msg.ttl > 0 {
                    msg.ttl -= 1;
                    match msg.to_line() {
                        Ok(forward) => self.broadcast_except(&forward, Some(origin)),
                        Err(e) => {
                            tracing::warn!(msg_id = %msg.msg_id, error = %e, "re-serialize failed")
                        }
                    }
                }

                self.deliver_upward(line);
            }
        }
    }

    /// Cancel all tasks and close every session. The node is terminal
    /// afterwards.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        let mut peers = self.peers.write();
        for session in peers.values() {
            session.close();
        }
        peers.clear();
        tracing::info!(node = %self.node_id, "mesh node shut down");
    }

    fn deliver_upward(&self, line: &str) {
        let handler = self.message_handler.read().clone();
        if let Some(handler) = handler {
            handler(line);
        }
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = node.shutdown_token.cancelled() => break,
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                if node.peers.read().len() >= node.config.max_connections {
                                    tracing::warn!(%addr, "max connections reached, rejecting");
                                    continue;
                                }
                                if let Err(e) = node.register_session(stream, addr) {
                                    tracing::warn!(%addr, error = %e, "incoming connection failed");
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "accept error");
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_line_dispatcher(self: &Arc<Self>, mut incoming_rx: mpsc::Receiver<(SessionId, String)>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = node.shutdown_token.cancelled() => break,
                    msg = incoming_rx.recv() => {
                        let Some((origin, line)) = msg else { break };
                        node.handle_line(origin, &line);
                    }
                }
            }
        });
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = node.shutdown_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let seq = node.ping_seq.fetch_add(1, Ordering::Relaxed);
                        let ping = WireMsg::ping(&node.node_id, seq, current_timestamp_ms());
                        match ping.to_line() {
                            Ok(line) => node.broadcast(&line),
                            Err(e) => tracing::error!(error = %e, "ping serialization failed"),
                        }
                        node.sweep_peers();
                    }
                }
            }
        });
    }

    /// Heartbeat sweep: drop dead sessions and close any peer that has
    /// produced nothing inbound for `missed_heartbeat_limit`
    /// consecutive sweeps.
    fn sweep_peers(&self) {
        let limit = self.config.missed_heartbeat_limit;
        self.peers.write().retain(|id, session| {
            if !session.alive() {
                return false;
            }
            let missed = session.record_missed_heartbeat();
            if missed >= limit {
                tracing::warn!(session = %id, missed, "peer silent too long, closing");
                session.close();
                return false;
            }
            true
        });
    }

    /// Wrap an established socket in a session, add it to the peer set
    /// and start its read/write tasks.
    fn register_session(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<SessionId, MeshError> {
        configure_keepalive(&stream)?;

        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let cancel_token = self.shutdown_token.child_token();
        let (session, mut send_rx) =
            Session::new(id, addr, self.config.send_queue_capacity, cancel_token);

        let framed = Framed::new(stream, Codec::new(self.config.max_line_length));
        let (mut sink, mut stream) = framed.split();

        self.peers.write().insert(id, Arc::clone(&session));
        tracing::info!(session = %id, %addr, "peer session started");

        let write_session = Arc::clone(&session);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_session.cancel_token().cancelled() => break,
                    msg = send_rx.recv() => {
                        match msg {
                            Some(line) => {
                                if let Err(e) = sink.send(line).await {
                                    tracing::warn!(session = %write_session.id(), error = %e, "write error");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            write_session.close();
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel_token().cancelled() => break,
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(line)) => {
                                session.saw_activity();
                                if line.is_empty() {
                                    continue;
                                }
                                if node.incoming_tx.send((session.id(), line)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                tracing::warn!(session = %session.id(), error = %e, "read error");
                                break;
                            }
                            None => {
                                tracing::info!(session = %session.id(), "connection closed by remote");
                                break;
                            }
                        }
                    }
                }
            }
            session.close();
            node.remove_session(session.id());
        });

        Ok(id)
    }

    fn remove_session(&self, id: SessionId) {
        if self.peers.write().remove(&id).is_some() {
            tracing::info!(session = %id, "peer session removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn chat_line(msg_id: &str, sender: &str, ttl: i32) -> String {
        WireMsg {
            msg_id: msg_id.into(),
            msg_type: "chat".into(),
            sender: sender.into(),
            priority: 0,
            timestamp: current_timestamp_ms(),
            ttl,
            content: "hi".into(),
            chunk_index: 0,
            chunk_total: 0,
        }
        .to_line()
        .unwrap()
    }

    /// Opt into log output for the suite with e.g. `RUST_LOG=debug`.
    fn init_logging() {
        use std::sync::Once;

        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_ansi(false)
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        });
    }

    async fn create_node(node_id: &str) -> Arc<MeshNode> {
        create_node_with(node_id, MeshConfig::default()).await
    }

    async fn create_node_with(node_id: &str, config: MeshConfig) -> Arc<MeshNode> {
        init_logging();
        let node = MeshNode::new(0, NodeId::new(node_id), config)
            .await
            .unwrap();
        node.start();
        node
    }

    /// Install a handler that appends every delivered line to the
    /// returned store.
    fn collect_messages(node: &MeshNode) -> Arc<Mutex<Vec<String>>> {
        let store = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&store);
        node.on_message(move |line| sink.lock().push(line.to_owned()));
        store
    }

    fn count_with_id(store: &Mutex<Vec<String>>, msg_id: &str) -> usize {
        let needle = format!("\"msg_id\":\"{msg_id}\"");
        store.lock().iter().filter(|l| l.contains(&needle)).count()
    }

    async fn connect_nodes(from: &Arc<MeshNode>, to: &Arc<MeshNode>) {
        from.connect_to_peer("127.0.0.1", to.local_addr().port())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    async fn wait_until(f: impl Fn() -> bool, timeout_ms: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Raw wire-level probe: a plain TCP client speaking newline
    /// frames, for observing exactly what a node puts on the wire.
    async fn probe(node: &MeshNode) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", node.local_addr().port()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream
    }

    /// Read whole lines off `stream` until `dur` elapses.
    async fn read_lines_for(stream: &mut TcpStream, dur: Duration) -> Vec<String> {
        let mut reader = BufReader::new(stream);
        let mut lines = Vec::new();
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            let mut line = String::new();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, reader.read_line(&mut line)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => lines.push(line.trim_end().to_owned()),
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }
        lines
    }

    // --- protocol core, direct -------------------------------------------

    #[tokio::test]
    async fn test_dedup_gates_upward_delivery() {
        let node = MeshNode::new(0, NodeId::new("n"), MeshConfig::default())
            .await
            .unwrap();
        let received = collect_messages(&node);

        let line = chat_line("d1", "other", 0);
        node.handle_line(SessionId(0), &line);
        node.handle_line(SessionId(0), &line);
        node.handle_line(SessionId(0), &line);

        assert_eq!(count_with_id(&received, "d1"), 1);
    }

    #[tokio::test]
    async fn test_fresh_node_has_empty_seen_state() {
        let line = chat_line("restart1", "other", 0);

        let node = MeshNode::new(0, NodeId::new("n"), MeshConfig::default())
            .await
            .unwrap();
        let received = collect_messages(&node);
        node.handle_line(SessionId(0), &line);
        node.handle_line(SessionId(0), &line);
        assert_eq!(count_with_id(&received, "restart1"), 1);

        // no durability: a fresh node treats the same id as new
        let node2 = MeshNode::new(0, NodeId::new("n"), MeshConfig::default())
            .await
            .unwrap();
        let received2 = collect_messages(&node2);
        node2.handle_line(SessionId(0), &line);
        assert_eq!(count_with_id(&received2, "restart1"), 1);
    }

    #[tokio::test]
    async fn test_opaque_frames_bypass_dedup() {
        let node = MeshNode::new(0, NodeId::new("n"), MeshConfig::default())
            .await
            .unwrap();
        let received = collect_messages(&node);

        node.handle_line(SessionId(0), r#"{"text":"raw"}"#);
        node.handle_line(SessionId(0), r#"{"text":"raw"}"#);

        assert_eq!(received.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_frames_dropped() {
        let node = MeshNode::new(0, NodeId::new("n"), MeshConfig::default())
            .await
            .unwrap();
        let received = collect_messages(&node);

        node.handle_line(SessionId(0), "not-json");
        // msg_id present but envelope incomplete
        node.handle_line(SessionId(0), r#"{"msg_id":"m"}"#);

        assert!(received.lock().is_empty());
    }

    // --- two-node end-to-end ---------------------------------------------

    #[tokio::test]
    async fn test_two_node_chat_delivered_once() {
        let node_a = create_node("node_a").await;
        let node_b = create_node("node_b").await;
        let a_received = collect_messages(&node_a);
        let b_received = collect_messages(&node_b);

        connect_nodes(&node_a, &node_b).await;
        assert!(wait_until(|| node_b.peer_count() == 1, 2000).await);

        node_a.broadcast(&chat_line("x1", "node_a", 2));

        assert!(wait_until(|| count_with_id(&b_received, "x1") == 1, 2000).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // B delivered it exactly once and A never heard its own frame back
        assert_eq!(count_with_id(&b_received, "x1"), 1);
        assert_eq!(count_with_id(&a_received, "x1"), 0);

        node_a.shutdown();
        node_b.shutdown();
    }

    #[tokio::test]
    async fn test_three_node_ttl_chain() {
        let node_a = create_node("chain_a").await;
        let node_b = create_node("chain_b").await;
        let node_c = create_node("chain_c").await;
        let a_received = collect_messages(&node_a);
        let b_received = collect_messages(&node_b);
        let c_received = collect_messages(&node_c);

        // chain A - B - C
        connect_nodes(&node_a, &node_b).await;
        connect_nodes(&node_b, &node_c).await;
        assert!(wait_until(|| node_b.peer_count() == 2, 2000).await);

        node_a.broadcast(&chat_line("t1", "chain_a", 1));

        assert!(wait_until(|| count_with_id(&c_received, "t1") == 1, 2000).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(count_with_id(&b_received, "t1"), 1);
        assert_eq!(count_with_id(&c_received, "t1"), 1);
        assert_eq!(count_with_id(&a_received, "t1"), 0);

        // C saw the frame after B spent the last hop
        let c_lines = c_received.lock();
        let line = c_lines
            .iter()
            .find(|l| l.contains("\"msg_id\":\"t1\""))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["ttl"], 0);
        drop(c_lines);

        node_a.shutdown();
        node_b.shutdown();
        node_c.shutdown();
    }

    #[tokio::test]
    async fn test_bridge_send_reaches_peer_and_history() {
        let node_a = create_node("bridge_a").await;
        let node_b = create_node("bridge_b").await;
        let b_received = collect_messages(&node_b);

        connect_nodes(&node_a, &node_b).await;
        assert!(wait_until(|| node_b.peer_count() == 1, 2000).await);

        let history = Arc::new(RingBuffer::new(16));
        let bridge = Bridge::new(Arc::clone(&node_a), Arc::clone(&history));

        bridge.handle_send(r#"{"msg_id":"via-bridge","type":"chat","sender":"bridge_a","ttl":3,"content":"hello"}"#);

        assert!(wait_until(|| count_with_id(&b_received, "via-bridge") == 1, 2000).await);

        let recv = bridge.handle_recv(0);
        let value: serde_json::Value = serde_json::from_str(&recv).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["msg_id"], "via-bridge");
        assert!(items[0]["timestamp"].as_i64().unwrap() > 0);

        node_a.shutdown();
        node_b.shutdown();
    }

    // --- wire-level probes -----------------------------------------------

    #[tokio::test]
    async fn test_duplicate_from_wire_suppressed() {
        let node = create_node("dedup_node").await;
        let received = collect_messages(&node);

        let mut probe = probe(&node).await;
        let line = chat_line("w1", "probe", 0);
        probe.write_all(line.as_bytes()).await.unwrap();
        probe.write_all(b"\n").await.unwrap();
        probe.write_all(line.as_bytes()).await.unwrap();
        probe.write_all(b"\n").await.unwrap();
        probe.flush().await.unwrap();

        assert!(wait_until(|| count_with_id(&received, "w1") >= 1, 2000).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count_with_id(&received, "w1"), 1);

        node.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_json_keeps_session_open() {
        let node = create_node("resilient_node").await;
        let received = collect_messages(&node);

        let mut probe = probe(&node).await;
        probe.write_all(b"not-json\n").await.unwrap();
        probe
            .write_all(format!("{}\n", chat_line("after-garbage", "probe", 0)).as_bytes())
            .await
            .unwrap();
        probe.flush().await.unwrap();

        // the frame after the garbage is processed normally
        assert!(wait_until(|| count_with_id(&received, "after-garbage") == 1, 2000).await);
        assert_eq!(node.peer_count(), 1);

        node.shutdown();
    }

    #[tokio::test]
    async fn test_forward_excludes_origin_session() {
        let node = create_node("hub").await;

        let mut sender = probe(&node).await;
        let mut other = probe(&node).await;
        assert!(wait_until(|| node.peer_count() == 2, 2000).await);

        let line = chat_line("fwd1", "sender-probe", 3);
        sender
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
        sender.flush().await.unwrap();

        // the other peer receives the forwarded frame with ttl spent once
        let other_lines = read_lines_for(&mut other, Duration::from_millis(600)).await;
        let forwarded: Vec<&String> = other_lines
            .iter()
            .filter(|l| l.contains("\"msg_id\":\"fwd1\""))
            .collect();
        assert_eq!(forwarded.len(), 1);
        let value: serde_json::Value = serde_json::from_str(forwarded[0]).unwrap();
        assert_eq!(value["ttl"], 2);
        assert_eq!(value["sender"], "sender-probe");

        // the origin never gets its own frame back
        let sender_lines = read_lines_for(&mut sender, Duration::from_millis(300)).await;
        assert!(sender_lines.iter().all(|l| !l.contains("\"msg_id\":\"fwd1\"")));

        node.shutdown();
    }

    #[tokio::test]
    async fn test_ttl_zero_not_forwarded() {
        let node = create_node("terminal_hub").await;
        let received = collect_messages(&node);

        let mut sender = probe(&node).await;
        let mut other = probe(&node).await;
        assert!(wait_until(|| node.peer_count() == 2, 2000).await);

        let line = chat_line("term1", "sender-probe", 0);
        sender
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
        sender.flush().await.unwrap();

        assert!(wait_until(|| count_with_id(&received, "term1") == 1, 2000).await);

        let other_lines = read_lines_for(&mut other, Duration::from_millis(400)).await;
        assert!(other_lines.iter().all(|l| !l.contains("\"msg_id\":\"term1\"")));

        node.shutdown();
    }

    #[tokio::test]
    async fn test_opaque_frames_never_forwarded() {
        let node = create_node("opaque_hub").await;
        let received = collect_messages(&node);

        let mut sender = probe(&node).await;
        let mut other = probe(&node).await;
        assert!(wait_until(|| node.peer_count() == 2, 2000).await);

        sender
            .write_all(b"{\"text\":\"opaque payload\"}\n")
            .await
            .unwrap();
        sender.flush().await.unwrap();

        assert!(
            wait_until(
                || received.lock().iter().any(|l| l.contains("opaque payload")),
                2000
            )
            .await
        );

        let other_lines = read_lines_for(&mut other, Duration::from_millis(400)).await;
        assert!(other_lines.iter().all(|l| !l.contains("opaque payload")));

        node.shutdown();
    }

    #[tokio::test]
    async fn test_heartbeat_pings_on_wire() {
        let mut config = MeshConfig::default();
        config.heartbeat_interval_ms = 150;
        config.missed_heartbeat_limit = 100; // a silent probe must survive this test
        let node = create_node_with("hb_node", config).await;

        let mut probe = probe(&node).await;
        let lines = read_lines_for(&mut probe, Duration::from_millis(800)).await;

        let pings: Vec<WireMsg> = lines
            .iter()
            .filter_map(|l| match classify(l) {
                Ok(InboundFrame::Message(m)) if m.msg_type == PING_TYPE => Some(m),
                _ => None,
            })
            .collect();

        assert!(pings.len() >= 2, "expected >= 2 pings, got {}", pings.len());
        for ping in &pings {
            assert_eq!(ping.ttl, 0);
            assert_eq!(ping.sender, "hb_node");
            assert!(ping.msg_id.starts_with("hb_node-ping-"));
        }
        // the session stayed up throughout
        assert_eq!(node.peer_count(), 1);

        node.shutdown();
    }

    #[tokio::test]
    async fn test_silent_peer_evicted() {
        let mut config = MeshConfig::default();
        config.heartbeat_interval_ms = 100;
        config.missed_heartbeat_limit = 2;
        let node = create_node_with("sweeper", config).await;

        let mut probe = probe(&node).await;
        assert!(wait_until(|| node.peer_count() == 1, 2000).await);

        // never write anything; the sweep closes us
        assert!(wait_until(|| node.peer_count() == 0, 3000).await);

        // the socket is really gone: reads drain the buffered pings, then EOF
        let mut reader = BufReader::new(&mut probe);
        let mut sink = String::new();
        loop {
            sink.clear();
            match tokio::time::timeout(Duration::from_millis(1000), reader.read_line(&mut sink))
                .await
            {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => break,
                Err(_) => panic!("peer socket not closed after eviction"),
            }
        }

        node.shutdown();
    }

    #[tokio::test]
    async fn test_active_peer_survives_sweeps() {
        let mut config = MeshConfig::default();
        config.heartbeat_interval_ms = 100;
        config.missed_heartbeat_limit = 3;
        let node = create_node_with("keeper", config).await;

        let mut probe = probe(&node).await;
        for i in 0..12 {
            probe
                .write_all(format!("{}\n", chat_line(&format!("alive-{i}"), "probe", 0)).as_bytes())
                .await
                .unwrap();
            probe.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(node.peer_count(), 1);

        node.shutdown();
    }

    #[tokio::test]
    async fn test_eviction_on_exact_missed_limit() {
        let mut config = MeshConfig::default();
        // park the background sweep so the count below is exact
        config.heartbeat_interval_ms = 3_600_000;
        config.missed_heartbeat_limit = 3;
        let node = create_node_with("boundary", config).await;

        let _probe = probe(&node).await;
        assert!(wait_until(|| node.peer_count() == 1, 2000).await);

        node.sweep_peers();
        node.sweep_peers();
        assert_eq!(node.peer_count(), 1);

        // the third consecutive silent sweep closes the peer
        node.sweep_peers();
        assert_eq!(node.peer_count(), 0);

        node.shutdown();
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let mut config = MeshConfig::default();
        config.max_connections = 2;
        let node = create_node_with("bouncer", config).await;

        let _p1 = probe(&node).await;
        let _p2 = probe(&node).await;
        assert!(wait_until(|| node.peer_count() == 2, 2000).await);

        let mut p3 = probe(&node).await;
        // the third connection is dropped without a session
        let mut reader = BufReader::new(&mut p3);
        let mut line = String::new();
        match tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {}
            other => panic!("expected rejected connection, got {other:?}"),
        }
        assert_eq!(node.peer_count(), 2);

        node.shutdown();
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_peer_fails() {
        let node = create_node("dialer").await;

        // grab a port that nothing listens on
        let placeholder = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let dead_port = placeholder.local_addr().unwrap().port();
        drop(placeholder);

        let result = node.connect_to_peer("127.0.0.1", dead_port).await;
        assert!(result.is_err());
        assert_eq!(node.peer_count(), 0);

        node.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let node = create_node("closer").await;
        let mut probe = probe(&node).await;
        assert!(wait_until(|| node.peer_count() == 1, 2000).await);

        node.shutdown();

        let mut reader = BufReader::new(&mut probe);
        let mut line = String::new();
        loop {
            line.clear();
            match tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line)).await {
                Ok(Ok(0)) | Ok(Err(_)) => break,
                Ok(Ok(_)) => continue,
                Err(_) => panic!("socket still open after shutdown"),
            }
        }
        assert_eq!(node.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_last_handler_wins() {
        let node = MeshNode::new(0, NodeId::new("n"), MeshConfig::default())
            .await
            .unwrap();

        let first = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&first);
        node.on_message(move |line| sink.lock().push(line.to_owned()));

        let second = collect_messages(&node);

        node.handle_line(SessionId(0), r#"{"text":"for the second handler"}"#);
        assert!(first.lock().is_empty());
        assert_eq!(second.lock().len(), 1);
    }
}
