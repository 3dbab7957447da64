//! One logical connection and the streams it keeps alive.

use super::stream::{Stream, StreamDirection};
use ahash::AHashMap;
use quicmux_x::{ConnectionId, SessionId, StreamFactory, StreamHandle, StreamId};
use std::net::SocketAddr;
use std::time::Instant;

/// ```text
/// Created --first packet--> Active --teardown--> Closing --> (removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Closing,
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub write_errors: u64,
}

/// First server-initiated bidirectional stream id.
const FIRST_OUTGOING_STREAM: u64 = 1;
/// Stream ids of one type are spaced by the two type bits.
const STREAM_ID_STRIDE: u64 = 4;

pub struct Session {
    id: SessionId,
    conn_id: ConnectionId,
    self_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: SessionState,
    streams: AHashMap<StreamId, Stream>,
    stream_factory: Box<dyn StreamFactory>,
    next_outgoing: u64,
    stats: SessionStats,
    created_at: Instant,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        conn_id: ConnectionId,
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
        stream_factory: Box<dyn StreamFactory>,
    ) -> Self {
        Self {
            id,
            conn_id,
            self_addr,
            peer_addr,
            state: SessionState::Created,
            streams: AHashMap::new(),
            stream_factory,
            next_outgoing: FIRST_OUTGOING_STREAM,
            stats: SessionStats::default(),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Peers may migrate; the latest source address wins.
    pub(crate) fn set_peer_addr(&mut self, peer: SocketAddr) {
        self.peer_addr = peer;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn age_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// Ids of every live stream, sorted.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn stream_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub(crate) fn record_packet_in(&mut self, len: usize) {
        if self.state == SessionState::Created {
            self.state = SessionState::Active;
        }
        self.stats.packets_in += 1;
        self.stats.bytes_in += len as u64;
    }

    pub(crate) fn record_packet_out(&mut self, len: usize) {
        self.stats.packets_out += 1;
        self.stats.bytes_out += len as u64;
    }

    pub(crate) fn record_write_error(&mut self) {
        self.stats.write_errors += 1;
    }

    pub(crate) fn begin_closing(&mut self) {
        self.state = SessionState::Closing;
    }

    pub(crate) fn next_outgoing_stream_id(&mut self) -> StreamId {
        let id = StreamId(self.next_outgoing);
        self.next_outgoing += STREAM_ID_STRIDE;
        id
    }

    /// Build a stream through the factory and insert it into the live set
    /// before anyone else sees it.
    pub(crate) fn open_stream(&mut self, handle: StreamHandle, direction: StreamDirection) -> &mut Stream {
        let id = handle.stream_id();
        let sink = match direction {
            StreamDirection::Incoming => self.stream_factory.create_incoming_stream(handle),
            StreamDirection::Outgoing => self.stream_factory.create_outgoing_stream(handle),
        };
        if self.state == SessionState::Created {
            self.state = SessionState::Active;
        }
        self.stats.streams_opened += 1;
        let session = self.id;
        self.streams
            .entry(id)
            .or_insert_with(|| Stream::new(id, session, direction, sink))
    }

    /// Close a stream and drop it from the live set. Returns the removed
    /// stream, already closed.
    pub(crate) fn remove_stream(&mut self, id: StreamId) -> Option<Stream> {
        let mut stream = self.streams.remove(&id)?;
        stream.close();
        self.stats.streams_closed += 1;
        Some(stream)
    }

    /// Force-close every live stream. The set is empty afterwards.
    pub(crate) fn close_all_streams(&mut self) -> Vec<Stream> {
        let ids = self.stream_ids();
        ids.into_iter()
            .filter_map(|id| self.remove_stream(id))
            .collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("conn_id", &self.conn_id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .field("streams", &self.streams.len())
            .field("stats", &self.stats)
            .finish()
    }
}
