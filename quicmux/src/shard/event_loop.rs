//! One shard's event loop.
//!
//! Each shard thread builds a current-thread tokio runtime and selects over:
//!
//! ```text
//!   shutdown signal
//!   socket recv      -> route by connection id: own shard, or forward
//!   inbound channel  <- datagrams forwarded by sibling shards
//!   wake timer       -> ShardContext::do_tasks
//!   write completions
//!   application commands
//!   proof completions
//! ```
//!
//! Every shard holds a sender into every shard's inbound channel. Forwarding
//! uses `try_send`, so a slow sibling costs dropped datagrams, never a
//! stalled loop.

use super::context::ShardContext;
use super::writer::ShardWriter;
use super::{ProofSetup, ShardSetConfig};
use crate::clock::MonotonicClock;
use crate::dispatcher::Dispatcher;
use crate::engine::{Engine, EngineFactory};
use crate::netio::BufferPool;
use crate::proof::ProofService;
use crate::routing::{parse_connection_id, shard_for, ParseError, ParsedHeader};
use crate::runtime::create_shard_runtime;
use crate::telemetry::{record_metric, DropReason, MetricsEvent};
use anyhow::{Context, Result};
use bytes::Bytes;
use quicmux_x::SessionFactory;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

const POOL_STATS_INTERVAL: Duration = Duration::from_secs(10);

/// A datagram received by one shard on behalf of another.
#[derive(Debug)]
pub struct ForwardedDatagram {
    pub peer: SocketAddr,
    pub header: ParsedHeader,
    pub data: Bytes,
}

/// Where a received datagram goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Local(ParsedHeader),
    Forward(usize, ParsedHeader),
    Malformed(ParseError),
}

pub(crate) fn classify(datagram: &[u8], shard_id: usize, shards: usize) -> Route {
    match parse_connection_id(datagram) {
        Ok(header) => {
            let owner = shard_for(header.conn_id, shards);
            if owner == shard_id {
                Route::Local(header)
            } else {
                Route::Forward(owner, header)
            }
        }
        Err(e) => Route::Malformed(e),
    }
}

pub(crate) struct ShardSetup {
    pub shard_id: usize,
    pub socket: std::net::UdpSocket,
    pub local_addr: SocketAddr,
    pub config: Arc<ShardSetConfig>,
    pub session_factory: Arc<dyn SessionFactory>,
    pub engine_factory: EngineFactory,
    pub proofs: ProofSetup,
    pub inbound: mpsc::Receiver<ForwardedDatagram>,
    pub peers: Arc<Vec<mpsc::Sender<ForwardedDatagram>>>,
    pub shutdown: broadcast::Receiver<()>,
}

/// Thread body for `shard-{i}`.
pub(crate) fn run_shard(setup: ShardSetup) -> Result<()> {
    let shard_id = setup.shard_id;

    if setup.config.netio.pin_to_cpu {
        if let Some(core_id) = core_affinity::get_core_ids().and_then(|ids| ids.get(shard_id).copied()) {
            if core_affinity::set_for_current(core_id) {
                info!(shard_id, core_id = core_id.id, "Shard thread pinned to CPU core");
            } else {
                warn!(shard_id, "Failed to pin shard thread to CPU core");
            }
        }
    }

    let runtime = create_shard_runtime(shard_id)
        .with_context(|| format!("building runtime for shard {}", shard_id))?;
    let result = runtime.block_on(shard_main(setup));
    if let Err(e) = &result {
        error!(shard_id, error = ?e, "Shard event loop failed");
    }
    result
}

async fn shard_main(setup: ShardSetup) -> Result<()> {
    let ShardSetup {
        shard_id,
        socket,
        local_addr,
        config,
        session_factory,
        engine_factory,
        proofs,
        mut inbound,
        peers,
        mut shutdown,
    } = setup;
    let channels = &config.channels;

    let writer_socket = socket
        .try_clone()
        .context("cloning shard socket for the writer thread")?;
    let socket = UdpSocket::from_std(socket).context("registering shard socket with tokio")?;

    let (completion_tx, mut completion_rx) = mpsc::channel(channels.completion_capacity);
    let (command_tx, mut command_rx) = mpsc::channel(channels.command_capacity);
    let (proof_tx, mut proof_rx) = mpsc::channel(channels.proof_capacity);

    let writer = ShardWriter::spawn(
        shard_id,
        writer_socket,
        channels.write_queue_capacity,
        completion_tx,
    )
    .context("spawning writer thread")?;
    let dispatcher = Dispatcher::new(shard_id, session_factory, command_tx);
    let proof_service = ProofService::new(
        proofs.registry,
        proofs.signer,
        proof_tx,
        Some(tokio::runtime::Handle::current()),
    );

    let mut ctx = ShardContext::new(
        shard_id,
        local_addr,
        Box::new(MonotonicClock::new()),
        &config.scheduler,
        dispatcher,
        Box::new(writer),
        proof_service,
    );
    let mut engine = engine_factory(shard_id);
    let pool = BufferPool::from_config(&config.netio.buffer_pool);

    let mut generation = ctx.timer().generation;
    let sleep = tokio::time::sleep_until(ctx.timer().fire_at.into());
    tokio::pin!(sleep);
    let mut pool_stats = tokio::time::interval(POOL_STATS_INTERVAL);

    record_metric(MetricsEvent::ShardStarted);
    info!(shard_id, addr = %local_addr, secure = ctx.is_secure(), "Shard event loop started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(shard_id, "Shutdown signal received");
                break;
            }
            received = recv_datagram(&socket, &pool) => match received {
                Ok((peer, data)) => {
                    record_metric(MetricsEvent::PacketReceived { bytes: data.len() });
                    route_datagram(&mut ctx, engine.as_mut(), &peers, peer, data);
                }
                Err(e) => {
                    warn!(shard_id, error = %e, "Socket receive failed");
                    record_metric(MetricsEvent::NetworkReceiveError);
                }
            },
            Some(forwarded) = inbound.recv() => {
                ctx.process_parsed(engine.as_mut(), forwarded.peer, forwarded.header, forwarded.data);
            }
            () = &mut sleep => {
                ctx.do_tasks(engine.as_mut());
            }
            Some(completion) = completion_rx.recv() => {
                engine.on_write_complete(&mut ctx, completion);
            }
            Some(command) = command_rx.recv() => {
                ctx.handle_command(engine.as_mut(), command);
            }
            Some(completion) = proof_rx.recv() => {
                engine.on_proof_ready(&mut ctx, completion);
            }
            _ = pool_stats.tick() => {
                let stats = pool.stats();
                record_metric(MetricsEvent::BufferPoolUtilization {
                    idle: stats.idle,
                    capacity: stats.capacity,
                });
            }
        }

        let timer = ctx.timer();
        if timer.generation != generation {
            generation = timer.generation;
            sleep.as_mut().reset(timer.fire_at.into());
        }
    }

    engine.on_shutdown(&mut ctx);
    let closed = ctx.dispatcher_mut().delete_all_sessions();

    // The writer may be parked on a full completion queue; closing it first
    // lets the join in the writer's Drop finish.
    drop(completion_rx);
    drop(ctx);

    record_metric(MetricsEvent::ShardStopped);
    info!(shard_id, sessions_closed = closed, "Shard event loop stopped");
    Ok(())
}

async fn recv_datagram(socket: &UdpSocket, pool: &BufferPool) -> io::Result<(SocketAddr, Bytes)> {
    let mut buf = pool.get();
    let (len, peer) = socket.recv_from(&mut buf).await?;
    Ok((peer, Bytes::copy_from_slice(&buf[..len])))
}

fn route_datagram(
    ctx: &mut ShardContext,
    engine: &mut dyn Engine,
    peers: &[mpsc::Sender<ForwardedDatagram>],
    peer: SocketAddr,
    data: Bytes,
) {
    match classify(&data, ctx.shard_id(), peers.len()) {
        Route::Local(header) => ctx.process_parsed(engine, peer, header, data),
        Route::Forward(owner, header) => {
            let forwarded = ForwardedDatagram { peer, header, data };
            match peers[owner].try_send(forwarded) {
                Ok(()) => {
                    trace!(from = ctx.shard_id(), to = owner, conn_id = %header.conn_id, "Datagram forwarded");
                    record_metric(MetricsEvent::PacketForwarded);
                }
                Err(e) => {
                    debug!(to = owner, error = %e, "Forward queue unavailable, dropping datagram");
                    record_metric(MetricsEvent::PacketDropped {
                        reason: DropReason::ForwardQueueFull,
                    });
                }
            }
        }
        Route::Malformed(e) => {
            debug!(peer = %peer, error = %e, "Dropping malformed datagram");
            record_metric(MetricsEvent::PacketDropped {
                reason: DropReason::Malformed,
            });
        }
    }
}
