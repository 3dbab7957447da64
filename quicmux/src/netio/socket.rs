//! UDP socket creation with SO_REUSEPORT for sharded receive.
//!
//! Every shard binds its own socket to the same address. With SO_REUSEPORT
//! the kernel spreads incoming datagrams across those sockets; the shard
//! loop then forwards any datagram whose connection id belongs to a
//! different shard.

use crate::netio::config::NetIoConfig;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket as Socket2, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, warn};

/// Create, configure and bind a non-blocking UDP socket for one shard.
///
/// The writer thread sends through a `try_clone` of the returned socket.
/// The clone shares the non-blocking flag, so the writer waits for
/// writability itself when a send would block.
pub fn create_udp_socket(bind_addr: SocketAddr, config: &NetIoConfig) -> Result<UdpSocket> {
    let socket = Socket2::new(
        Domain::for_address(bind_addr),
        Type::DGRAM,
        Some(Protocol::UDP),
    )
    .context("creating UDP socket")?;

    apply_options(&socket, bind_addr, config)?;

    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("binding UDP socket to {}", bind_addr))?;
    socket
        .set_nonblocking(true)
        .context("setting O_NONBLOCK")?;

    let socket: UdpSocket = socket.into();
    debug!(
        addr = %socket.local_addr().unwrap_or(bind_addr),
        reuse_port = config.reuse_port,
        "Shard socket bound"
    );
    Ok(socket)
}

/// Everything that has to happen before `bind`.
fn apply_options(socket: &Socket2, bind_addr: SocketAddr, config: &NetIoConfig) -> Result<()> {
    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;

    if config.reuse_port {
        enable_reuse_port(socket).context("setting SO_REUSEPORT")?;
    }

    if let Some(size) = config.socket_recv_buffer_size {
        socket
            .set_recv_buffer_size(size)
            .with_context(|| format!("setting SO_RCVBUF to {}", size))?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket
            .set_send_buffer_size(size)
            .with_context(|| format!("setting SO_SNDBUF to {}", size))?;
    }

    // A wildcard v6 bind also takes v4-mapped traffic.
    if let SocketAddr::V6(addr) = bind_addr {
        socket
            .set_only_v6(!addr.ip().is_unspecified())
            .context("setting IPV6_V6ONLY")?;
    }
    Ok(())
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn enable_reuse_port(socket: &Socket2) -> io::Result<()> {
    match socket.set_reuse_port(true) {
        Err(e) if matches!(e.raw_os_error(), Some(libc::ENOPROTOOPT) | Some(libc::EINVAL)) => {
            warn!("SO_REUSEPORT rejected by the kernel, only one shard can bind");
            Ok(())
        }
        other => other,
    }
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn enable_reuse_port(_socket: &Socket2) -> io::Result<()> {
    warn!("SO_REUSEPORT not available on this platform");
    Ok(())
}
