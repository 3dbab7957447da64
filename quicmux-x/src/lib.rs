//! quicmux-x: Application Bridge for the quicmux core
//!
//! This crate defines the surface that applications see when a protocol
//! engine running inside a quicmux shard hands them sessions and streams.
//!
//! # Architecture
//!
//! - **Shards** (native threads, single-threaded event loops) own every
//!   session, stream and alarm. Nothing here is shared across shards.
//! - **Applications** plug in through three capability traits:
//!   [`SessionFactory`] (one per server), [`StreamFactory`] (one per session)
//!   and [`StreamSink`] (one per stream).
//! - **Egress**: a [`StreamHandle`] queues [`Command`]s onto the owning
//!   shard's work queue. The shard drains that queue between packets and
//!   timers, so response writing always happens on the shard thread.
//!
//! # Ingress Model
//!
//! Bytes for a stream are appended to its [`PendingData`] in delivery order
//! and the sink is offered the whole queue. Whatever the sink leaves behind
//! is still there, in order, on the next call.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Connection identifier parsed from the datagram header prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Shard-local session identity.
///
/// Issued by the dispatcher's handle table. Never reused within a shard's
/// lifetime, so a stale id held by an application can only miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// Unique identifier for a stream within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Check if this is a client-initiated stream.
    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x1) == 0
    }

    /// Check if this is a server-initiated stream.
    pub fn is_server_initiated(&self) -> bool {
        !self.is_client_initiated()
    }

    /// Check if this is a bidirectional stream.
    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x2) == 0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to applications.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The shard's command queue is full. Retry later or drop the write.
    #[error("shard command queue is full")]
    Backpressure,

    /// The owning shard has shut down.
    #[error("shard is no longer running")]
    ShardClosed,
}

/// Commands sent from applications to the owning shard (egress).
#[derive(Debug, Clone)]
pub enum Command {
    /// Write data to a stream.
    WriteStreamData {
        session: SessionId,
        stream_id: StreamId,
        /// Zero-copy data to send.
        data: Bytes,
        /// True to finish the stream after sending.
        fin: bool,
    },

    /// Close a stream locally.
    CloseStream {
        session: SessionId,
        stream_id: StreamId,
    },

    /// Tear the whole session down.
    CloseSession { session: SessionId },
}

impl Command {
    /// Session this command targets.
    pub fn session(&self) -> SessionId {
        match self {
            Command::WriteStreamData { session, .. }
            | Command::CloseStream { session, .. }
            | Command::CloseSession { session } => *session,
        }
    }
}

/// Ordered byte chunks delivered to a stream but not yet consumed.
#[derive(Debug, Default)]
pub struct PendingData {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl PendingData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Empty chunks are ignored.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Take the oldest chunk.
    pub fn pop_chunk(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.len -= chunk.len();
        Some(chunk)
    }

    /// Look at the oldest chunk without consuming it.
    pub fn peek_chunk(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Consume everything as one contiguous buffer.
    ///
    /// A single pending chunk is returned as-is without copying.
    pub fn take_all(&mut self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.pop_chunk().unwrap_or_default();
        }
        let mut out = BytesMut::with_capacity(self.len);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.len = 0;
        out.freeze()
    }

    /// Total pending bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pending chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

/// Handle an application uses to act on one stream.
///
/// Cheap to clone. All operations are non-blocking `try_send`s onto the
/// shard's bounded command queue.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    session: SessionId,
    stream_id: StreamId,
    commands: mpsc::Sender<Command>,
}

impl StreamHandle {
    pub fn new(session: SessionId, stream_id: StreamId, commands: mpsc::Sender<Command>) -> Self {
        Self {
            session,
            stream_id,
            commands,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Queue data for this stream. `fin` finishes the send side.
    pub fn write(&self, data: Bytes, fin: bool) -> Result<()> {
        self.send(Command::WriteStreamData {
            session: self.session,
            stream_id: self.stream_id,
            data,
            fin,
        })
    }

    /// Ask the shard to close this stream.
    pub fn close(&self) -> Result<()> {
        self.send(Command::CloseStream {
            session: self.session,
            stream_id: self.stream_id,
        })
    }

    /// Ask the shard to tear down the whole session.
    pub fn close_session(&self) -> Result<()> {
        self.send(Command::CloseSession {
            session: self.session,
        })
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.commands.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => Error::Backpressure,
            TrySendError::Closed(_) => Error::ShardClosed,
        })
    }
}

/// What a session factory learns about a new session.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub session: SessionId,
    pub conn_id: ConnectionId,
    pub self_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub shard_id: usize,
}

/// Server-wide hook invoked once per new session.
///
/// Shared by every shard, hence `Send + Sync`. The returned stream factory
/// lives on the shard thread that owns the session.
pub trait SessionFactory: Send + Sync {
    fn new_session(&self, info: &SessionInfo) -> Box<dyn StreamFactory>;
}

/// Per-session stream constructor.
pub trait StreamFactory {
    /// Peer opened a stream.
    fn create_incoming_stream(&mut self, handle: StreamHandle) -> Box<dyn StreamSink>;

    /// The engine opened a stream on our side.
    fn create_outgoing_stream(&mut self, handle: StreamHandle) -> Box<dyn StreamSink>;
}

/// Receiver of one stream's data and close notification.
pub trait StreamSink {
    /// New data was appended to `pending`. `fin` is true once the peer has
    /// finished sending. Unconsumed data stays queued.
    fn on_data_available(&mut self, pending: &mut PendingData, fin: bool);

    /// The stream was closed. Invoked exactly once.
    fn on_close(&mut self) {}
}
