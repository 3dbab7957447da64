use bytes::Bytes;
use quicmux_x::{PendingData, SessionId, StreamId, StreamSink};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Opened by the peer.
    Incoming,
    /// Opened on our side.
    Outgoing,
}

/// One request/response exchange inside a session.
///
/// Owned by its session's stream map; removing it from that map is what
/// frees it.
pub struct Stream {
    id: StreamId,
    session: SessionId,
    direction: StreamDirection,
    closed: bool,
    fin_received: bool,
    fin_sent: bool,
    pending: PendingData,
    sink: Box<dyn StreamSink>,
    opened_at: Instant,
    bytes_received: u64,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        session: SessionId,
        direction: StreamDirection,
        sink: Box<dyn StreamSink>,
    ) -> Self {
        Self {
            id,
            session,
            direction,
            closed: false,
            fin_received: false,
            fin_sent: false,
            pending: PendingData::new(),
            sink,
            opened_at: Instant::now(),
            bytes_received: 0,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    pub fn fin_sent(&self) -> bool {
        self.fin_sent
    }

    /// Bytes delivered but not yet consumed by the sink.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn age_ms(&self) -> u64 {
        self.opened_at.elapsed().as_millis() as u64
    }

    /// Append inbound bytes and offer the queue to the sink.
    ///
    /// Ignored once closed. Data after the peer's fin is dropped.
    pub(crate) fn deliver(&mut self, data: Bytes, fin: bool) {
        if self.closed || self.fin_received {
            return;
        }
        self.bytes_received += data.len() as u64;
        self.pending.push(data);
        if fin {
            self.fin_received = true;
        }
        self.sink.on_data_available(&mut self.pending, self.fin_received);
    }

    pub(crate) fn mark_fin_sent(&mut self) {
        self.fin_sent = true;
    }

    /// Close once. Returns `false` if already closed.
    pub(crate) fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.pending.clear();
        self.sink.on_close();
        true
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("direction", &self.direction)
            .field("closed", &self.closed)
            .field("fin_received", &self.fin_received)
            .field("pending", &self.pending.len())
            .finish()
    }
}
