//! Protocol engine boundary.
//!
//! The wire protocol itself lives behind [`Engine`]. The shard loop calls
//! into it for every event it selects on, always passing the shard's
//! [`ShardContext`] so the engine can arm alarms, write datagrams, manage
//! sessions and streams, and ask for proofs. Engines are built on their shard
//! thread and never leave it.

pub mod loopback;

pub use loopback::{
    decode_frame, encode_frame, EchoSessionFactory, Frame, FrameError, LoopbackConfig,
    LoopbackEngine, HANDSHAKE_STREAM, LOOPBACK_PROOF_VERSION, LOOPBACK_SERVER_CONFIG,
};

use crate::proof::ProofCompletion;
use crate::scheduler::{AlarmId, AlarmToken};
use crate::shard::{ShardContext, WriteCompletion};
use bytes::Bytes;
use quicmux_x::{ConnectionId, SessionId, StreamId};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// A datagram routed to this shard.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub self_addr: SocketAddr,
    pub peer: SocketAddr,
    pub conn_id: ConnectionId,
    /// Existing session for `conn_id`, if any.
    pub session: Option<SessionId>,
    /// Bytes of routing header at the front of `data`.
    pub header_len: usize,
    /// The whole datagram, header included.
    pub data: Bytes,
}

impl InboundPacket {
    /// Datagram bytes after the routing header.
    pub fn body(&self) -> Bytes {
        self.data.slice(self.header_len.min(self.data.len())..)
    }
}

pub trait Engine {
    /// A datagram for this shard.
    fn process_packet(&mut self, ctx: &mut ShardContext, packet: InboundPacket);

    /// An alarm created by this engine reached its deadline.
    fn on_alarm(&mut self, ctx: &mut ShardContext, alarm: AlarmId, token: AlarmToken);

    /// An application queued data on a stream.
    fn on_stream_write(
        &mut self,
        ctx: &mut ShardContext,
        session: SessionId,
        stream: StreamId,
        data: Bytes,
        fin: bool,
    );

    fn on_write_complete(&mut self, _ctx: &mut ShardContext, completion: WriteCompletion) {
        if let Some(kind) = completion.error {
            debug!(peer = %completion.peer, error = ?kind, "Write failed");
        }
    }

    /// An application closed a stream.
    fn on_stream_close(&mut self, ctx: &mut ShardContext, session: SessionId, stream: StreamId) {
        ctx.close_stream(session, stream);
    }

    /// An application asked for its session to be torn down.
    fn on_session_close(&mut self, ctx: &mut ShardContext, session: SessionId) {
        if let Err(e) = ctx.delete_session(session) {
            debug!(session = %session, error = %e, "Session close ignored");
        }
    }

    fn on_proof_ready(&mut self, _ctx: &mut ShardContext, completion: ProofCompletion) {
        if let Err(e) = completion.result {
            warn!(request_id = completion.request_id, error = %e, "Proof request failed");
        }
    }

    /// The shard is stopping. Sessions still registered are deleted after
    /// this returns.
    fn on_shutdown(&mut self, _ctx: &mut ShardContext) {}
}

/// Builds the engine for shard `i` on that shard's thread.
pub type EngineFactory = Arc<dyn Fn(usize) -> Box<dyn Engine> + Send + Sync>;
