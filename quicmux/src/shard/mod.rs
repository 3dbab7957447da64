//! Sharded UDP front end.
//!
//! # Architecture
//!
//! - N shard threads (`shard-{i}`), each with its own SO_REUSEPORT socket
//!   bound to the same address, its own current-thread runtime, buffer pool,
//!   dispatcher, alarm scheduler and engine instance.
//! - Every connection id has exactly one owning shard
//!   (`conn_id % shards`). A shard that receives a datagram for a sibling
//!   forwards it over that sibling's bounded inbound channel.
//! - Each shard has one `writer-{i}` thread doing the actual `send_to`.
//!
//! Nothing on the datagram path takes a lock.

mod context;
mod event_loop;
pub mod writer;

#[cfg(test)]
mod tests;

pub use context::ShardContext;
pub use event_loop::ForwardedDatagram;
pub use writer::{PacketWriter, ShardWriter, WriteCompletion, WriteStatus};

use crate::channel_config::ChannelConfig;
use crate::engine::EngineFactory;
use crate::handle_table::Handle;
use crate::netio::{create_udp_socket, NetIoConfig};
use crate::proof::SignerRegistry;
use crate::scheduler::SchedulerConfig;
use anyhow::{Context, Result};
use event_loop::ShardSetup;
use quicmux_x::SessionFactory;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

/// Settings every shard is started with.
#[derive(Debug, Clone, Default)]
pub struct ShardSetConfig {
    pub netio: NetIoConfig,
    pub channels: ChannelConfig,
    pub scheduler: SchedulerConfig,
}

/// Signer shared by all shards. `signer: None` runs insecure.
#[derive(Clone, Default)]
pub struct ProofSetup {
    pub registry: SignerRegistry,
    pub signer: Option<Handle>,
}

impl ProofSetup {
    pub fn insecure() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for ProofSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofSetup")
            .field("signers", &self.registry.len())
            .field("signer", &self.signer)
            .finish()
    }
}

/// Running shard set.
///
/// Dropping the handle signals shutdown without waiting; call
/// [`ShardSetHandle::shutdown`] to join the shard threads.
pub struct ShardSetHandle {
    shards: Vec<JoinHandle<Result<()>>>,
    shutdown: broadcast::Sender<()>,
    local_addr: SocketAddr,
    shard_count: usize,
}

impl ShardSetHandle {
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Bound address. Resolves port 0 to the port actually chosen.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal every shard to stop and wait for them.
    pub fn shutdown(mut self) {
        info!("Shutting down shards");
        let _ = self.shutdown.send(());

        for (i, shard) in self.shards.drain(..).enumerate() {
            match shard.join() {
                Ok(Ok(())) => debug!(shard_id = i, "Shard thread exited cleanly"),
                Ok(Err(e)) => error!(shard_id = i, error = ?e, "Shard thread returned error"),
                Err(e) => error!(shard_id = i, error = ?e, "Shard thread panicked"),
            }
        }

        info!("Shard shutdown complete");
    }
}

impl Drop for ShardSetHandle {
    fn drop(&mut self) {
        if !self.shards.is_empty() {
            debug!("ShardSetHandle dropped, signaling shutdown");
            let _ = self.shutdown.send(());
        }
    }
}

/// Bind `config.netio.shards` sockets to `bind_addr` and start a shard on
/// each.
///
/// Sockets are bound here, on the calling thread, so bind errors surface to
/// the caller. With port 0 the first socket picks the port and the rest
/// join it.
pub fn spawn(
    bind_addr: SocketAddr,
    config: ShardSetConfig,
    session_factory: Arc<dyn SessionFactory>,
    engine_factory: EngineFactory,
    proofs: ProofSetup,
) -> Result<ShardSetHandle> {
    let shard_count = config.netio.shards;
    if shard_count == 0 {
        anyhow::bail!("netio.shards must be at least 1");
    }
    if shard_count > 1 && !config.netio.reuse_port {
        anyhow::bail!("netio.reuse_port must be enabled to run more than one shard");
    }

    info!(
        shards = shard_count,
        addr = %bind_addr,
        pin_to_cpu = config.netio.pin_to_cpu,
        secure = proofs.signer.is_some(),
        "Starting shards"
    );

    let mut sockets = Vec::with_capacity(shard_count);
    let mut local_addr = bind_addr;
    for shard_id in 0..shard_count {
        let socket = create_udp_socket(local_addr, &config.netio)
            .with_context(|| format!("creating socket for shard {}", shard_id))?;
        if shard_id == 0 {
            local_addr = socket.local_addr().context("reading bound address")?;
        }
        sockets.push(socket);
    }

    let (senders, receivers): (Vec<_>, Vec<_>) = (0..shard_count)
        .map(|_| mpsc::channel(config.channels.inbound_capacity))
        .unzip();
    let peers = Arc::new(senders);
    let (shutdown, _) = broadcast::channel(1);
    let config = Arc::new(config);

    let mut shards = Vec::with_capacity(shard_count);
    for (shard_id, (socket, inbound)) in sockets.into_iter().zip(receivers).enumerate() {
        let setup = ShardSetup {
            shard_id,
            socket,
            local_addr,
            config: Arc::clone(&config),
            session_factory: Arc::clone(&session_factory),
            engine_factory: Arc::clone(&engine_factory),
            proofs: proofs.clone(),
            inbound,
            peers: Arc::clone(&peers),
            shutdown: shutdown.subscribe(),
        };

        let handle = thread::Builder::new()
            .name(format!("shard-{}", shard_id))
            .spawn(move || event_loop::run_shard(setup))
            .with_context(|| format!("spawning shard thread {}", shard_id))?;
        shards.push(handle);
    }

    info!(shards = shard_count, addr = %local_addr, "Shards started");

    Ok(ShardSetHandle {
        shards,
        shutdown,
        local_addr,
        shard_count,
    })
}
