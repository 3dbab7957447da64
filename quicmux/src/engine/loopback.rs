//! Demonstration engine with a trivial framing.
//!
//! ```text
//! +-------+-----------+----------------+--------+---------+
//! | flags | conn id   | stream id le32 | fin u8 | payload |
//! +-------+-----------+----------------+--------+---------+
//!   routing header
//! ```
//!
//! The routing header follows the shard routing rules; outbound frames always
//! use the 8-byte connection id encoding. There is no loss recovery or
//! encryption: the point is to exercise sessions, streams, alarms and proofs
//! end to end.
//!
//! # Handshake
//!
//! Optional. A client that wants the server authenticated sends a hello on
//! [`HANDSHAKE_STREAM`] whose payload is its hello hash. The server answers
//! on the same stream with its proof signature over
//! `proof_payload(LOOPBACK_PROOF_VERSION, LOOPBACK_SERVER_CONFIG, hash)`, or
//! with an empty payload when it has no signing key. Frames on other streams
//! are served with or without a handshake.

use super::{Engine, InboundPacket};
use crate::proof::{proof_payload, ProofCompletion};
use crate::scheduler::{AlarmId, AlarmToken};
use crate::shard::ShardContext;
use crate::telemetry::{record_metric, DropReason, MetricsEvent};
use ahash::AHashMap;
use bytes::{BufMut, Bytes, BytesMut};
use quicmux_x::{
    ConnectionId, PendingData, SessionFactory, SessionId, SessionInfo, StreamFactory,
    StreamHandle, StreamId, StreamSink,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Flags byte announcing an 8-byte connection id.
pub const LOOPBACK_FLAGS: u8 = 0x08;
const ROUTING_HEADER_LEN: usize = 1 + 8;
const FRAME_HEADER_LEN: usize = 4 + 1;

/// Reserved stream carrying the hello and its proof. Never opened in the
/// dispatcher.
pub const HANDSHAKE_STREAM: StreamId = StreamId(u32::MAX as u64);
/// Proof version the loopback handshake signs under.
pub const LOOPBACK_PROOF_VERSION: u32 = 43;
/// Server config bytes bound into every loopback proof.
pub const LOOPBACK_SERVER_CONFIG: &[u8] = b"quicmux loopback/1";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Sessions with no traffic for this long are torn down.
    ///
    /// **Default:** 30000 ms
    pub idle_timeout_ms: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
        }
    }
}

impl LoopbackConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        if self.idle_timeout_ms == 0 {
            return Err(vec!["loopback.idle_timeout_ms must be > 0".to_string()]);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub fin: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame body too short: {0} bytes")]
    Short(usize),
    #[error("stream {0} does not fit the 32-bit frame header")]
    StreamIdOverflow(StreamId),
}

/// Build a complete datagram.
pub fn encode_frame(
    conn_id: ConnectionId,
    stream_id: StreamId,
    fin: bool,
    payload: &[u8],
) -> Result<Bytes, FrameError> {
    let wire_id =
        u32::try_from(stream_id.0).map_err(|_| FrameError::StreamIdOverflow(stream_id))?;
    let mut buf = BytesMut::with_capacity(ROUTING_HEADER_LEN + FRAME_HEADER_LEN + payload.len());
    buf.put_u8(LOOPBACK_FLAGS);
    buf.put_u64_le(conn_id.0);
    buf.put_u32_le(wire_id);
    buf.put_u8(u8::from(fin));
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Parse the part of a datagram after its routing header.
pub fn decode_frame(body: Bytes) -> Result<Frame, FrameError> {
    if body.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Short(body.len()));
    }
    let mut id = [0u8; 4];
    id.copy_from_slice(&body[..4]);
    Ok(Frame {
        stream_id: StreamId(u64::from(u32::from_le_bytes(id))),
        fin: body[4] != 0,
        payload: body.slice(FRAME_HEADER_LEN..),
    })
}

pub struct LoopbackEngine {
    shard_id: usize,
    idle_timeout: Duration,
    /// Idle alarm per live session.
    sessions: AHashMap<SessionId, AlarmId>,
    /// Outstanding proof request id -> session waiting on it.
    pending_proofs: AHashMap<u64, SessionId>,
}

impl LoopbackEngine {
    pub fn new(shard_id: usize, config: &LoopbackConfig) -> Self {
        Self {
            shard_id,
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            sessions: AHashMap::new(),
            pending_proofs: AHashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn open_session(&mut self, ctx: &mut ShardContext, packet: &InboundPacket) -> Option<SessionId> {
        match ctx.create_session(packet.conn_id, packet.self_addr, packet.peer) {
            Ok(session) => {
                let alarm = ctx.create_alarm(AlarmToken(session.0));
                self.sessions.insert(session, alarm);
                info!(
                    shard_id = self.shard_id,
                    session = %session,
                    conn_id = %packet.conn_id,
                    peer = %packet.peer,
                    "Loopback session opened"
                );
                Some(session)
            }
            Err(e) => {
                warn!(shard_id = self.shard_id, conn_id = %packet.conn_id, error = %e, "Failed to create session");
                None
            }
        }
    }

    /// Push the idle deadline out.
    fn touch(&self, ctx: &mut ShardContext, session: SessionId) {
        if let Some(alarm) = self.sessions.get(&session) {
            let deadline = ctx.now() + self.idle_timeout;
            ctx.set_alarm(*alarm, deadline);
        }
    }

    fn answer_hello(&mut self, ctx: &mut ShardContext, session: SessionId, chlo_hash: &[u8]) {
        if !ctx.is_secure() {
            send_frame(ctx, session, HANDSHAKE_STREAM, &[], true);
            return;
        }
        let payload = proof_payload(LOOPBACK_PROOF_VERSION, LOOPBACK_SERVER_CONFIG, chlo_hash);
        let request_id = ctx.request_proof(payload);
        self.pending_proofs.insert(request_id, session);
        debug!(session = %session, request_id, "Proof requested");
    }

    fn teardown(&mut self, ctx: &mut ShardContext, session: SessionId) {
        self.pending_proofs.retain(|_, waiting| *waiting != session);
        if let Some(alarm) = self.sessions.remove(&session) {
            ctx.destroy_alarm(alarm);
        }
        match ctx.delete_session(session) {
            Ok(stats) => info!(
                shard_id = self.shard_id,
                session = %session,
                packets_in = stats.packets_in,
                packets_out = stats.packets_out,
                "Loopback session closed"
            ),
            Err(e) => debug!(session = %session, error = %e, "Session already gone"),
        }
    }
}

impl Engine for LoopbackEngine {
    fn process_packet(&mut self, ctx: &mut ShardContext, packet: InboundPacket) {
        let frame = match decode_frame(packet.body()) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %packet.peer, error = %e, "Dropping unparseable frame");
                record_metric(MetricsEvent::PacketDropped {
                    reason: DropReason::Rejected,
                });
                return;
            }
        };

        let session = match packet.session {
            Some(session) => session,
            None => match self.open_session(ctx, &packet) {
                Some(session) => session,
                None => return,
            },
        };
        ctx.dispatcher_mut()
            .record_packet_in(session, packet.data.len());

        if frame.stream_id == HANDSHAKE_STREAM {
            self.answer_hello(ctx, session, &frame.payload);
            self.touch(ctx, session);
            return;
        }

        let known = ctx
            .dispatcher()
            .session(session)
            .map(|s| s.has_stream(frame.stream_id))
            .unwrap_or(false);
        if !known {
            if let Err(e) = ctx.create_incoming_stream(session, frame.stream_id) {
                debug!(session = %session, stream = %frame.stream_id, error = %e, "Cannot open stream");
                return;
            }
        }

        let stream = frame.stream_id;
        if let Err(e) = ctx.deliver_stream_data(session, stream, frame.payload, frame.fin) {
            debug!(session = %session, stream = %stream, error = %e, "Delivery failed");
        }
        self.touch(ctx, session);
        close_if_finished(ctx, session, stream);
    }

    fn on_alarm(&mut self, ctx: &mut ShardContext, _alarm: AlarmId, token: AlarmToken) {
        let session = SessionId(token.0);
        debug!(shard_id = self.shard_id, session = %session, "Idle timeout");
        self.teardown(ctx, session);
    }

    fn on_stream_write(
        &mut self,
        ctx: &mut ShardContext,
        session: SessionId,
        stream: StreamId,
        data: Bytes,
        fin: bool,
    ) {
        if !send_frame(ctx, session, stream, &data, fin) {
            return;
        }
        if fin {
            if let Err(e) = ctx.dispatcher_mut().mark_fin_sent(session, stream) {
                debug!(session = %session, stream = %stream, error = %e, "Fin for unknown stream");
            }
            close_if_finished(ctx, session, stream);
        }
        self.touch(ctx, session);
    }

    fn on_session_close(&mut self, ctx: &mut ShardContext, session: SessionId) {
        self.teardown(ctx, session);
    }

    fn on_proof_ready(&mut self, ctx: &mut ShardContext, completion: ProofCompletion) {
        let Some(session) = self.pending_proofs.remove(&completion.request_id) else {
            debug!(request_id = completion.request_id, "Proof for a closed session");
            return;
        };
        match completion.result {
            Ok(signature) => {
                send_frame(ctx, session, HANDSHAKE_STREAM, &signature, true);
            }
            Err(e) => {
                warn!(session = %session, error = %e, "Proof signing failed, closing session");
                self.teardown(ctx, session);
            }
        }
    }

    fn on_shutdown(&mut self, ctx: &mut ShardContext) {
        let sessions: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session in sessions {
            self.teardown(ctx, session);
        }
    }
}

/// Frame `data` for `stream` and send it to the session's current peer.
/// False when nothing could be handed to the writer.
pub(crate) fn send_frame(
    ctx: &mut ShardContext,
    session: SessionId,
    stream: StreamId,
    data: &[u8],
    fin: bool,
) -> bool {
    let conn_id = match ctx.dispatcher().session(session) {
        Ok(s) => s.conn_id(),
        Err(_) => {
            debug!(session = %session, "Write for closed session dropped");
            return false;
        }
    };
    let frame = match encode_frame(conn_id, stream, fin, data) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session = %session, stream = %stream, error = %e, "Write dropped");
            return false;
        }
    };
    if let Err(e) = ctx.send_to_session(session, frame) {
        debug!(session = %session, error = %e, "Send failed");
        return false;
    }
    true
}

/// Close a stream once both directions have finished.
pub(crate) fn close_if_finished(ctx: &mut ShardContext, session: SessionId, stream: StreamId) {
    let done = ctx
        .dispatcher()
        .stream(session, stream)
        .map(|s| s.fin_received() && s.fin_sent())
        .unwrap_or(false);
    if done {
        ctx.close_stream(session, stream);
    }
}

/// Application that echoes every stream back to its sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoSessionFactory;

impl SessionFactory for EchoSessionFactory {
    fn new_session(&self, _info: &SessionInfo) -> Box<dyn StreamFactory> {
        Box::new(EchoStreams)
    }
}

struct EchoStreams;

impl StreamFactory for EchoStreams {
    fn create_incoming_stream(&mut self, handle: StreamHandle) -> Box<dyn StreamSink> {
        Box::new(EchoSink {
            handle,
            finished: false,
        })
    }

    fn create_outgoing_stream(&mut self, handle: StreamHandle) -> Box<dyn StreamSink> {
        self.create_incoming_stream(handle)
    }
}

struct EchoSink {
    handle: StreamHandle,
    finished: bool,
}

impl StreamSink for EchoSink {
    fn on_data_available(&mut self, pending: &mut PendingData, fin: bool) {
        if self.finished {
            pending.clear();
            return;
        }
        let data = pending.take_all();
        if data.is_empty() && !fin {
            return;
        }
        match self.handle.write(data, fin) {
            Ok(()) => self.finished = fin,
            Err(e) => warn!(
                session = %self.handle.session(),
                stream = %self.handle.stream_id(),
                error = %e,
                "Echo write refused"
            ),
        }
    }
}
