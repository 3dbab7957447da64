//! Network I/O utilities module.
//!
//! This module provides the shard-independent pieces of the datagram path:
//! - Bounded buffer pool for the receive path
//! - Socket creation and configuration
//! - Network I/O configuration
//!
//! For the per-shard event loop, see the `shard` module.

pub mod buffer;
pub mod config;
pub(crate) mod socket;


pub use buffer::{BufferPool, PoolStats, PooledBuffer};
pub use config::{BufferPoolConfig, NetIoConfig};
pub(crate) use socket::create_udp_socket;
