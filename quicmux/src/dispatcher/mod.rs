//! Per-shard session registry.
//!
//! # Architecture
//!
//! - The [`Dispatcher`] owns every live [`Session`] through a
//!   [`HandleTable`]. The session's handle doubles as its [`SessionId`], so
//!   whatever an engine or application holds is only ever an integer.
//! - A `ConnectionId -> SessionId` index routes datagrams to sessions.
//! - Each session owns its live [`Stream`]s. A stream is in its session's
//!   map from the moment the factory builds it until it is closed, and that
//!   removal is the only thing that frees it.
//!
//! # Teardown Ordering
//!
//! [`Dispatcher::delete_session`] force-closes every stream first and only
//! then removes the session, so a session never leaves the live set while it
//! still owns streams.

pub mod session;
pub mod stream;

#[cfg(test)]
mod tests;

pub use session::{Session, SessionState, SessionStats};
pub use stream::{Stream, StreamDirection};

use crate::handle_table::{Handle, HandleError, HandleTable};
use crate::telemetry::{record_metric, MetricsEvent};
use ahash::AHashMap;
use bytes::Bytes;
use quicmux_x::{Command, ConnectionId, SessionFactory, SessionId, SessionInfo, StreamHandle, StreamId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("connection {0} already has a session")]
    DuplicateSession(ConnectionId),

    #[error("stream {stream} already exists in session {session}")]
    DuplicateStream { session: SessionId, stream: StreamId },

    #[error("unknown stream {stream} in session {session}")]
    UnknownStream { session: SessionId, stream: StreamId },

    #[error(transparent)]
    Handle(#[from] HandleError),
}

/// Point-in-time view of a shard's sessions.
#[derive(Debug, Clone, Default)]
pub struct DispatcherStatistics {
    pub shard_id: usize,
    pub live_sessions: usize,
    pub live_streams: usize,
    /// Sorted by session id.
    pub sessions: Vec<(SessionId, SessionStats)>,
}

pub struct Dispatcher {
    shard_id: usize,
    factory: Arc<dyn SessionFactory>,
    sessions: HandleTable<Session>,
    by_conn: AHashMap<ConnectionId, SessionId>,
    commands: mpsc::Sender<Command>,
}

fn handle_of(session: SessionId) -> Handle {
    Handle::from_raw(session.0)
}

impl Dispatcher {
    /// `commands` is the shard's application command queue; every
    /// [`StreamHandle`] handed out sends into it.
    pub fn new(
        shard_id: usize,
        factory: Arc<dyn SessionFactory>,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            shard_id,
            factory,
            sessions: HandleTable::new(),
            by_conn: AHashMap::new(),
            commands,
        }
    }

    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    /// Session that owns `conn_id`, if any.
    #[inline]
    pub fn route(&self, conn_id: ConnectionId) -> Option<SessionId> {
        self.by_conn.get(&conn_id).copied()
    }

    /// Register a new session for `conn_id` and build its stream factory.
    pub fn create_session(
        &mut self,
        conn_id: ConnectionId,
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Result<SessionId> {
        if self.by_conn.contains_key(&conn_id) {
            return Err(DispatchError::DuplicateSession(conn_id));
        }

        let shard_id = self.shard_id;
        let factory = &self.factory;
        let handle = self.sessions.insert_with(|handle| {
            let info = SessionInfo {
                session: SessionId(handle.raw()),
                conn_id,
                self_addr,
                peer_addr,
                shard_id,
            };
            let stream_factory = factory.new_session(&info);
            Session::new(info.session, conn_id, self_addr, peer_addr, stream_factory)
        })?;

        let session = SessionId(handle.raw());
        self.by_conn.insert(conn_id, session);
        record_metric(MetricsEvent::SessionCreated);
        debug!(
            shard_id = self.shard_id,
            session = %session,
            conn_id = %conn_id,
            peer = %peer_addr,
            "Session created"
        );
        Ok(session)
    }

    /// Force-close the session's streams, then drop the session.
    pub fn delete_session(&mut self, session: SessionId) -> Result<SessionStats> {
        let entry = self.session_mut(session)?;
        entry.begin_closing();
        for stream in entry.close_all_streams() {
            record_metric(MetricsEvent::StreamClosed {
                duration_ms: stream.age_ms(),
            });
        }
        debug_assert_eq!(entry.stream_count(), 0);

        let removed = self.sessions.remove(handle_of(session))?;
        self.by_conn.remove(&removed.conn_id());
        let stats = removed.stats();
        record_metric(MetricsEvent::SessionClosed {
            duration_ms: removed.age_ms(),
        });
        debug!(
            shard_id = self.shard_id,
            session = %session,
            packets_in = stats.packets_in,
            packets_out = stats.packets_out,
            streams = stats.streams_opened,
            "Session deleted"
        );
        Ok(stats)
    }

    /// Tear down every session. Used at shard shutdown.
    pub fn delete_all_sessions(&mut self) -> usize {
        let mut ids = self.session_ids();
        ids.sort_unstable();
        ids.into_iter()
            .filter(|id| self.delete_session(*id).is_ok())
            .count()
    }

    pub fn session(&self, session: SessionId) -> Result<&Session> {
        self.sessions
            .get(handle_of(session))
            .map_err(|_| DispatchError::UnknownSession(session))
    }

    pub fn session_mut(&mut self, session: SessionId) -> Result<&mut Session> {
        self.sessions
            .get_mut(handle_of(session))
            .map_err(|_| DispatchError::UnknownSession(session))
    }

    pub fn contains_session(&self, session: SessionId) -> bool {
        self.sessions.contains(handle_of(session))
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions
            .handles()
            .into_iter()
            .map(|h| SessionId(h.raw()))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Peer opened `stream_id`.
    pub fn create_incoming_stream(&mut self, session: SessionId, stream_id: StreamId) -> Result<()> {
        self.open_stream(session, stream_id, StreamDirection::Incoming)
    }

    /// Open a stream on our side. Ids run `1, 5, 9, ...`.
    pub fn create_outgoing_stream(&mut self, session: SessionId) -> Result<StreamId> {
        let stream_id = {
            let entry = self.session_mut(session)?;
            let mut id = entry.next_outgoing_stream_id();
            while entry.has_stream(id) {
                id = entry.next_outgoing_stream_id();
            }
            id
        };
        self.open_stream(session, stream_id, StreamDirection::Outgoing)?;
        Ok(stream_id)
    }

    fn open_stream(
        &mut self,
        session: SessionId,
        stream_id: StreamId,
        direction: StreamDirection,
    ) -> Result<()> {
        let handle = StreamHandle::new(session, stream_id, self.commands.clone());
        let entry = self.session_mut(session)?;
        if entry.has_stream(stream_id) {
            return Err(DispatchError::DuplicateStream {
                session,
                stream: stream_id,
            });
        }
        entry.open_stream(handle, direction);
        record_metric(MetricsEvent::StreamOpened);
        trace!(session = %session, stream = %stream_id, ?direction, "Stream opened");
        Ok(())
    }

    pub fn stream(&self, session: SessionId, stream_id: StreamId) -> Result<&Stream> {
        self.session(session)?
            .stream(stream_id)
            .ok_or(DispatchError::UnknownStream {
                session,
                stream: stream_id,
            })
    }

    /// Hand inbound bytes to a stream's sink, in delivery order.
    pub fn deliver_stream_data(
        &mut self,
        session: SessionId,
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
    ) -> Result<()> {
        let stream = self
            .session_mut(session)?
            .stream_mut(stream_id)
            .ok_or(DispatchError::UnknownStream {
                session,
                stream: stream_id,
            })?;
        trace!(session = %session, stream = %stream_id, len = data.len(), fin, "Stream data");
        stream.deliver(data, fin);
        Ok(())
    }

    /// Note that our side has sent fin on `stream_id`.
    pub fn mark_fin_sent(&mut self, session: SessionId, stream_id: StreamId) -> Result<()> {
        self.session_mut(session)?
            .stream_mut(stream_id)
            .map(Stream::mark_fin_sent)
            .ok_or(DispatchError::UnknownStream {
                session,
                stream: stream_id,
            })
    }

    /// Close a stream and drop it from its session.
    ///
    /// Close notifications race with session teardown, so closing a stream
    /// that is already gone (or never existed) is a no-op returning `false`.
    pub fn close_stream(&mut self, session: SessionId, stream_id: StreamId) -> bool {
        let removed = match self.sessions.get_mut(handle_of(session)) {
            Ok(entry) => entry.remove_stream(stream_id),
            Err(_) => None,
        };
        match removed {
            Some(stream) => {
                record_metric(MetricsEvent::StreamClosed {
                    duration_ms: stream.age_ms(),
                });
                trace!(session = %session, stream = %stream_id, "Stream closed");
                true
            }
            None => {
                debug!(session = %session, stream = %stream_id, "Close for unknown stream ignored");
                false
            }
        }
    }

    pub fn record_packet_in(&mut self, session: SessionId, len: usize) {
        if let Ok(entry) = self.session_mut(session) {
            entry.record_packet_in(len);
        }
    }

    pub fn record_packet_out(&mut self, session: SessionId, len: usize) {
        if let Ok(entry) = self.session_mut(session) {
            entry.record_packet_out(len);
        }
    }

    pub fn record_write_error(&mut self, session: SessionId) {
        if let Ok(entry) = self.session_mut(session) {
            entry.record_write_error();
        }
    }

    pub fn statistics(&self) -> DispatcherStatistics {
        let mut sessions: Vec<(SessionId, SessionStats)> = self
            .sessions
            .iter()
            .map(|(_, s)| (s.id(), s.stats()))
            .collect();
        sessions.sort_unstable_by_key(|(id, _)| *id);

        DispatcherStatistics {
            shard_id: self.shard_id,
            live_sessions: self.sessions.len(),
            live_streams: self.sessions.iter().map(|(_, s)| s.stream_count()).sum(),
            sessions,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("shard_id", &self.shard_id)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
