//! Single-connection loopback client.
//!
//! A [`ClientConn`] is one shard's worth of machinery driving one outgoing
//! session: its own [`ShardContext`] with alarms, dispatcher and writer
//! thread, plus a socket that only accepts datagrams from the server.
//! Nothing runs in the background. Every call that waits drives the event
//! loop itself, so a connection stays on the runtime that created it.
//!
//! ```text
//!   connect()  -> hello on the handshake stream, wait for the proof
//!   open_stream() / write()
//!   read()     -> drive events until the stream has data or fin
//! ```
//!
//! With a [`ProofVerifier`] the server must answer the hello with a valid
//! signature made by the verifier's key. Without one, any answer is
//! accepted.

mod engine;
mod inbox;


pub use engine::{ClientEngine, CloseReason, ConnState};

use self::inbox::{Inbox, InboxFactory};
use crate::clock::MonotonicClock;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::engine::Engine;
use crate::netio::BufferPool;
use crate::proof::{ProofCompletion, ProofError, ProofService, ProofVerifier, SignerRegistry};
use crate::routing::parse_connection_id;
use crate::scheduler::{SchedulerConfig, MAX_IDLE_TIMER_SECS};
use crate::shard::{ShardContext, ShardWriter, WriteCompletion};
use bytes::{Bytes, BytesMut};
use quicmux_x::{Command, ConnectionId, SessionId, StreamId};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Shard id the client's context reports.
const CLIENT_SHARD_ID: usize = 0;
const CHLO_HASH_LEN: usize = 32;
/// Receive buffers kept idle; a client rarely has more than one in flight.
const CLIENT_POOL_BUFFERS: usize = 4;
const CLIENT_BUFFER_SIZE: usize = 65_535;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Give up when the server has not answered the hello by then.
    ///
    /// **Default:** 5000 ms
    pub connect_timeout_ms: u64,

    /// Close after this long without traffic either way.
    ///
    /// **Default:** 30000 ms
    pub idle_timeout_ms: u64,

    /// Bound on queued outbound datagrams and on pending commands.
    ///
    /// **Default:** 1024
    pub write_queue_capacity: usize,

    pub scheduler: SchedulerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 30_000,
            write_queue_capacity: 1024,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let max_ms = MAX_IDLE_TIMER_SECS * 1000;

        if self.connect_timeout_ms == 0 || self.connect_timeout_ms > max_ms {
            errors.push(format!("client.connect_timeout_ms must be in 1..={}", max_ms));
        }
        if self.idle_timeout_ms == 0 || self.idle_timeout_ms > max_ms {
            errors.push(format!("client.idle_timeout_ms must be in 1..={}", max_ms));
        }
        if self.write_queue_capacity == 0 {
            errors.push("client.write_queue_capacity must be > 0".to_string());
        }
        if let Err(e) = self.scheduler.validate() {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid client config: {0}")]
    Config(String),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Proof(#[from] ProofError),

    #[error("connection closed: {0:?}")]
    Closed(CloseReason),
}

pub type Result<T> = std::result::Result<T, ClientError>;

enum Event {
    Datagram(SocketAddr, Bytes),
    Timer,
    Completion(WriteCompletion),
    Command(Command),
}

/// One client connection to a loopback server.
pub struct ClientConn {
    // Dropped before `ctx`: the writer thread may be parked on a full
    // completion queue while `ctx` joins it.
    completions: mpsc::Receiver<WriteCompletion>,
    commands: mpsc::Receiver<Command>,
    // Kept open so the insecure proof service has somewhere to report.
    _proofs: mpsc::Receiver<ProofCompletion>,
    socket: UdpSocket,
    server: SocketAddr,
    pool: BufferPool,
    inbox: Inbox,
    engine: ClientEngine,
    ctx: ShardContext,
}

impl ClientConn {
    /// Open a session with `server` and wait for the handshake.
    pub async fn connect(
        server: SocketAddr,
        conn_id: ConnectionId,
        verifier: Option<ProofVerifier>,
        config: &ClientConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ClientError::Config(e.join("; ")))?;

        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let std_socket = std::net::UdpSocket::bind(bind)?;
        std_socket.set_nonblocking(true)?;
        let local_addr = std_socket.local_addr()?;
        let writer_socket = std_socket.try_clone()?;
        let socket = UdpSocket::from_std(std_socket)?;

        let capacity = config.write_queue_capacity;
        let (completion_tx, completions) = mpsc::channel(capacity);
        let (command_tx, commands) = mpsc::channel(capacity);
        let (proof_tx, proofs) = mpsc::channel(1);

        let writer = ShardWriter::spawn(CLIENT_SHARD_ID, writer_socket, capacity, completion_tx)?;
        let inbox = Inbox::default();
        let dispatcher = Dispatcher::new(
            CLIENT_SHARD_ID,
            Arc::new(InboxFactory::new(Arc::clone(&inbox))),
            command_tx,
        );
        let proof_service = ProofService::new(SignerRegistry::new(), None, proof_tx, None);
        let mut ctx = ShardContext::new(
            CLIENT_SHARD_ID,
            local_addr,
            Box::new(MonotonicClock::new()),
            &config.scheduler,
            dispatcher,
            Box::new(writer),
            proof_service,
        );

        let session = ctx.create_session(conn_id, local_addr, server)?;
        let mut chlo_hash = vec![0u8; CHLO_HASH_LEN];
        boring::rand::rand_bytes(&mut chlo_hash).map_err(ProofError::from)?;

        let mut engine = ClientEngine::new(
            session,
            std::time::Duration::from_millis(config.idle_timeout_ms),
            verifier,
            chlo_hash,
        );
        engine.start(
            &mut ctx,
            std::time::Duration::from_millis(config.connect_timeout_ms),
        );

        let mut conn = Self {
            completions,
            commands,
            _proofs: proofs,
            socket,
            server,
            pool: BufferPool::new(CLIENT_POOL_BUFFERS, CLIENT_BUFFER_SIZE),
            inbox,
            engine,
            ctx,
        };
        debug!(server = %server, local = %local_addr, conn_id = %conn_id, "Client connecting");

        while conn.engine.state() == &ConnState::Handshaking {
            conn.process_events().await?;
        }
        conn.ensure_open()?;
        Ok(conn)
    }

    pub fn state(&self) -> &ConnState {
        self.engine.state()
    }

    pub fn session(&self) -> SessionId {
        self.engine.session()
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.local_addr()
    }

    /// Open a stream from our side.
    pub fn open_stream(&mut self) -> Result<StreamId> {
        self.ensure_open()?;
        Ok(self.ctx.create_outgoing_stream(self.session())?)
    }

    /// Send `data` on `stream`, closing our direction when `fin` is set.
    pub fn write(&mut self, stream: StreamId, data: Bytes, fin: bool) -> Result<()> {
        self.ensure_open()?;
        let session = self.session();
        self.ctx.dispatcher().stream(session, stream)?;
        self.engine
            .on_stream_write(&mut self.ctx, session, stream, data, fin);
        Ok(())
    }

    /// Next chunk received on `stream`, or `None` once the server sent fin
    /// and every chunk has been read.
    pub async fn read(&mut self, stream: StreamId) -> Result<Option<Bytes>> {
        loop {
            {
                let mut inbox = self.inbox.lock();
                let Some(entry) = inbox.get_mut(&stream) else {
                    return Err(DispatchError::UnknownStream {
                        session: self.engine.session(),
                        stream,
                    }
                    .into());
                };
                if let Some(chunk) = entry.chunks.pop_front() {
                    return Ok(Some(chunk));
                }
                if entry.fin {
                    return Ok(None);
                }
            }
            self.ensure_open()?;
            self.process_events().await?;
        }
    }

    /// Everything the server sends on `stream` up to its fin.
    pub async fn read_to_end(&mut self, stream: StreamId) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.read(stream).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Close the session. Queued datagrams are still flushed by the writer.
    pub fn close(mut self) {
        let session = self.session();
        self.ctx
            .handle_command(&mut self.engine, Command::CloseSession { session });
    }

    fn ensure_open(&self) -> Result<()> {
        match self.engine.state() {
            ConnState::Closed(reason) => Err(ClientError::Closed(reason.clone())),
            _ => Ok(()),
        }
    }

    /// Wait for one event and hand it to the engine.
    async fn process_events(&mut self) -> Result<()> {
        let fire_at = self.ctx.timer().fire_at;
        let event = {
            let mut buf = self.pool.get();
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = received?;
                    Event::Datagram(peer, Bytes::copy_from_slice(&buf[..len]))
                }
                () = tokio::time::sleep_until(fire_at.into()) => Event::Timer,
                Some(completion) = self.completions.recv() => Event::Completion(completion),
                Some(command) = self.commands.recv() => Event::Command(command),
            }
        };

        match event {
            Event::Datagram(peer, data) => {
                if peer != self.server {
                    trace!(peer = %peer, "Datagram from unexpected peer dropped");
                    return Ok(());
                }
                match parse_connection_id(&data) {
                    Ok(header) => self
                        .ctx
                        .process_parsed(&mut self.engine, peer, header, data),
                    Err(e) => debug!(peer = %peer, error = %e, "Dropping malformed datagram"),
                }
            }
            Event::Timer => {
                self.ctx.do_tasks(&mut self.engine);
            }
            Event::Completion(completion) => {
                self.engine.on_write_complete(&mut self.ctx, completion);
            }
            Event::Command(command) => {
                self.ctx.handle_command(&mut self.engine, command);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("server", &self.server)
            .field("session", &self.engine.session())
            .field("state", self.engine.state())
            .finish()
    }
}
