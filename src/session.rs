//! One peer session: the line codec that frames the TCP stream and the
//! shared handle carrying its write queue and liveness state.
//!
//! The I/O itself runs in two tasks spawned by the owning
//! [`MeshNode`](crate::MeshNode) when the session is registered: a read
//! task that pulls decoded lines off the framed stream and a write task
//! that drains the send queue one frame at a time, preserving enqueue
//! order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use crate::error::MeshError;
use crate::types::SessionId;

/// Frames the wire into UTF-8 lines delimited strictly by `'\n'`.
///
/// A line longer than `max_line_length` (terminator included) or one
/// that is not valid UTF-8 violates the framing contract and errors,
/// which closes the session; garbage *inside* a well-framed line is a
/// protocol matter handled upstream. Encoding appends the terminator
/// when the frame lacks one.
pub struct LineCodec {
    max_line_length: usize,
}

impl LineCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self { max_line_length }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = MeshError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src.iter().position(|&b| b == b'\n');

        let Some(pos) = newline else {
            if src.len() >= self.max_line_length {
                return Err(MeshError::LineTooLong(src.len()));
            }
            return Ok(None);
        };

        if pos + 1 > self.max_line_length {
            return Err(MeshError::LineTooLong(pos + 1));
        }

        let frame = src.split_to(pos + 1);
        let line = std::str::from_utf8(&frame[..pos]).map_err(|_| MeshError::InvalidUtf8)?;
        Ok(Some(line.to_owned()))
    }
}

impl Encoder<String> for LineCodec {
    type Error = MeshError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        if !item.ends_with('\n') {
            dst.put_u8(b'\n');
        }
        Ok(())
    }
}

/// Shared handle for one live TCP connection to a peer.
///
/// The handle is what the node's peer map owns; the read and write
/// tasks hold their own clones for the lifetime of the socket. Once
/// `closed` flips, the session is terminal: `deliver` becomes a no-op
/// and the next broadcast or heartbeat sweep prunes the entry.
pub struct Session {
    id: SessionId,
    addr: SocketAddr,
    send_tx: mpsc::Sender<String>,
    cancel_token: CancellationToken,
    closed: AtomicBool,
    missed_heartbeats: AtomicU32,
}

impl Session {
    /// Create the handle plus the receiving half of its bounded write
    /// queue. The caller spawns the I/O tasks and hands the receiver to
    /// the write task.
    pub(crate) fn new(
        id: SessionId,
        addr: SocketAddr,
        queue_capacity: usize,
        cancel_token: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (send_tx, send_rx) = mpsc::channel(queue_capacity);
        let session = Arc::new(Self {
            id,
            addr,
            send_tx,
            cancel_token,
            closed: AtomicBool::new(false),
            missed_heartbeats: AtomicU32::new(0),
        });
        (session, send_rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Enqueue `line` for transmission. The codec appends the `'\n'`
    /// terminator if the frame lacks one. A no-op once the session is
    /// closed; reports `SendQueueFull` when the bounded queue is full
    /// (the frame is dropped for this peer only).
    pub fn deliver(&self, line: &str) -> Result<(), MeshError> {
        if !self.alive() {
            return Ok(());
        }
        match self.send_tx.try_send(line.to_owned()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(MeshError::SendQueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(MeshError::SessionClosed)
            }
        }
    }

    /// Idempotent. Marks the session terminal and cancels its I/O
    /// tasks; the sockets are released when the tasks drop their
    /// framed halves, OS errors ignored. Queued frames are discarded.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_token.cancel();
    }

    /// Called by the read task on every inbound frame.
    pub(crate) fn saw_activity(&self) {
        self.missed_heartbeats.store(0, Ordering::Release);
    }

    /// Called once per heartbeat sweep; returns the new count of
    /// consecutive sweeps without inbound activity.
    pub(crate) fn record_missed_heartbeat(&self) -> u32 {
        self.missed_heartbeats.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

/// Apply TCP keepalive so a silently vanished peer is eventually torn
/// down at the socket level even if the heartbeat policy is disabled
/// by configuration.
pub(crate) fn configure_keepalive(stream: &TcpStream) -> Result<(), MeshError> {
    use socket2::SockRef;

    let sock = SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));

    #[cfg(not(target_os = "windows"))]
    let keepalive = keepalive.with_retries(3);

    sock.set_tcp_keepalive(&keepalive)?;

    Ok(())
}
