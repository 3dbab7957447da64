//! Client half of the loopback protocol.

use crate::engine::loopback::{close_if_finished, send_frame};
use crate::engine::{
    decode_frame, Engine, InboundPacket, HANDSHAKE_STREAM, LOOPBACK_PROOF_VERSION,
    LOOPBACK_SERVER_CONFIG,
};
use crate::proof::{ProofError, ProofVerifier};
use crate::scheduler::{AlarmId, AlarmToken};
use crate::shard::ShardContext;
use bytes::Bytes;
use quicmux_x::{SessionId, StreamId};
use std::time::Duration;
use tracing::{debug, info, warn};

const HANDSHAKE_TOKEN: AlarmToken = AlarmToken(1);
const IDLE_TOKEN: AlarmToken = AlarmToken(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    /// Hello sent, no answer yet.
    Handshaking,
    Connected,
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    HandshakeTimeout,
    ProofRejected(ProofError),
    IdleTimeout,
    Local,
}

/// Drives the single session of a [`super::ClientConn`].
pub struct ClientEngine {
    session: SessionId,
    state: ConnState,
    verifier: Option<ProofVerifier>,
    chlo_hash: Vec<u8>,
    idle_timeout: Duration,
    handshake_alarm: Option<AlarmId>,
    idle_alarm: Option<AlarmId>,
}

impl ClientEngine {
    pub fn new(
        session: SessionId,
        idle_timeout: Duration,
        verifier: Option<ProofVerifier>,
        chlo_hash: Vec<u8>,
    ) -> Self {
        Self {
            session,
            state: ConnState::Handshaking,
            verifier,
            chlo_hash,
            idle_timeout,
            handshake_alarm: None,
            idle_alarm: None,
        }
    }

    pub fn state(&self) -> &ConnState {
        &self.state
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Send the hello and arm both timers.
    pub fn start(&mut self, ctx: &mut ShardContext, connect_timeout: Duration) {
        let handshake = ctx.create_alarm(HANDSHAKE_TOKEN);
        let deadline = ctx.now() + connect_timeout;
        ctx.set_alarm(handshake, deadline);
        self.handshake_alarm = Some(handshake);
        self.idle_alarm = Some(ctx.create_alarm(IDLE_TOKEN));
        self.touch(ctx);

        send_frame(ctx, self.session, HANDSHAKE_STREAM, &self.chlo_hash, true);
        debug!(session = %self.session, secure = self.verifier.is_some(), "Hello sent");
    }

    fn touch(&self, ctx: &mut ShardContext) {
        if let Some(alarm) = self.idle_alarm {
            let deadline = ctx.now() + self.idle_timeout;
            ctx.set_alarm(alarm, deadline);
        }
    }

    fn check_proof(&self, signature: &[u8]) -> Result<(), ProofError> {
        let Some(verifier) = &self.verifier else {
            if !signature.is_empty() {
                debug!(session = %self.session, "Ignoring proof, no verifier configured");
            }
            return Ok(());
        };
        if signature.is_empty() {
            return Err(ProofError::Insecure);
        }
        verifier.verify_proof(
            LOOPBACK_PROOF_VERSION,
            LOOPBACK_SERVER_CONFIG,
            &self.chlo_hash,
            signature,
        )
    }

    fn finish_handshake(&mut self, ctx: &mut ShardContext, signature: &[u8]) {
        if self.state != ConnState::Handshaking {
            debug!(session = %self.session, "Duplicate handshake reply");
            return;
        }
        match self.check_proof(signature) {
            Ok(()) => {
                if let Some(alarm) = self.handshake_alarm.take() {
                    ctx.destroy_alarm(alarm);
                }
                self.state = ConnState::Connected;
                info!(session = %self.session, verified = self.verifier.is_some(), "Client connected");
            }
            Err(e) => {
                warn!(session = %self.session, error = %e, "Server proof rejected");
                self.close(ctx, CloseReason::ProofRejected(e));
            }
        }
    }

    /// Tear the session down. Later calls keep the first reason.
    pub fn close(&mut self, ctx: &mut ShardContext, reason: CloseReason) {
        if matches!(self.state, ConnState::Closed(_)) {
            return;
        }
        for alarm in [self.handshake_alarm.take(), self.idle_alarm.take()]
            .into_iter()
            .flatten()
        {
            ctx.destroy_alarm(alarm);
        }
        match ctx.delete_session(self.session) {
            Ok(stats) => info!(
                session = %self.session,
                reason = ?reason,
                packets_in = stats.packets_in,
                packets_out = stats.packets_out,
                "Client connection closed"
            ),
            Err(e) => debug!(session = %self.session, error = %e, "Session already gone"),
        }
        self.state = ConnState::Closed(reason);
    }
}

impl Engine for ClientEngine {
    fn process_packet(&mut self, ctx: &mut ShardContext, packet: InboundPacket) {
        if packet.session != Some(self.session) {
            debug!(conn_id = %packet.conn_id, peer = %packet.peer, "Datagram for another connection");
            return;
        }
        let frame = match decode_frame(packet.body()) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %packet.peer, error = %e, "Dropping unparseable frame");
                return;
            }
        };
        let session = self.session;
        ctx.dispatcher_mut()
            .record_packet_in(session, packet.data.len());
        self.touch(ctx);

        if frame.stream_id == HANDSHAKE_STREAM {
            self.finish_handshake(ctx, &frame.payload);
            return;
        }

        let stream = frame.stream_id;
        let known = ctx
            .dispatcher()
            .session(session)
            .map(|s| s.has_stream(stream))
            .unwrap_or(false);
        if !known {
            if let Err(e) = ctx.create_incoming_stream(session, stream) {
                debug!(session = %session, stream = %stream, error = %e, "Cannot open stream");
                return;
            }
        }
        if let Err(e) = ctx.deliver_stream_data(session, stream, frame.payload, frame.fin) {
            debug!(session = %session, stream = %stream, error = %e, "Delivery failed");
        }
        close_if_finished(ctx, session, stream);
    }

    fn on_alarm(&mut self, ctx: &mut ShardContext, alarm: AlarmId, token: AlarmToken) {
        match token {
            HANDSHAKE_TOKEN => {
                self.handshake_alarm = None;
                ctx.destroy_alarm(alarm);
                if self.state == ConnState::Handshaking {
                    self.close(ctx, CloseReason::HandshakeTimeout);
                }
            }
            IDLE_TOKEN => self.close(ctx, CloseReason::IdleTimeout),
            other => debug!(token = other.0, "Unknown client alarm"),
        }
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
        self.touch(ctx);
    }

    fn on_session_close(&mut self, ctx: &mut ShardContext, _session: SessionId) {
        self.close(ctx, CloseReason::Local);
    }

    fn on_shutdown(&mut self, ctx: &mut ShardContext) {
        self.close(ctx, CloseReason::Local);
    }
}
