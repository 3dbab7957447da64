use serde::{Deserialize, Serialize};

/// Largest datagram the receive path accepts (IPv4/IPv6 UDP payload limit).
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Default receive buffer size. Datagrams are copied out of the pooled
/// buffer before dispatch, so one buffer covers any datagram size.
pub const DEFAULT_BUFFER_SIZE: usize = MAX_DATAGRAM_SIZE;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Maximum number of idle buffers each shard keeps.
    /// Buffers returned beyond this are dropped.
    pub max_buffers_per_shard: usize,
    /// Size in bytes of every pooled buffer.
    pub buffer_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_buffers_per_shard: 64,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetIoConfig {
    /// Number of shards to spawn.
    /// Each shard is a native OS thread with its own socket and event loop.
    /// Defaults to number of CPU cores.
    pub shards: usize,

    /// Enable SO_REUSEPORT so every shard can bind the same UDP port.
    /// Required when `shards > 1`.
    pub reuse_port: bool,

    /// Pin each shard thread to a specific CPU core for cache locality.
    #[serde(default = "default_true")]
    pub pin_to_cpu: bool,

    /// Optional kernel receive buffer size (SO_RCVBUF).
    /// Larger buffers reduce packet loss under burst traffic.
    pub socket_recv_buffer_size: Option<usize>,

    /// Optional kernel send buffer size (SO_SNDBUF).
    pub socket_send_buffer_size: Option<usize>,

    /// Receive buffer pool configuration (per shard).
    pub buffer_pool: BufferPoolConfig,
}

fn default_true() -> bool {
    true
}

impl Default for NetIoConfig {
    fn default() -> Self {
        Self {
            shards: num_cpus::get().max(1),
            reuse_port: true,
            pin_to_cpu: true,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
            buffer_pool: BufferPoolConfig::default(),
        }
    }
}

impl NetIoConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.shards == 0 {
            errors.push("netio.shards must be > 0".to_string());
        }
        if self.shards > 1 && !self.reuse_port {
            errors.push("netio.reuse_port must be enabled when running more than one shard".to_string());
        }
        if self.buffer_pool.buffer_size == 0 {
            errors.push("netio.buffer_pool.buffer_size must be > 0".to_string());
        }
        if self.buffer_pool.buffer_size > MAX_DATAGRAM_SIZE {
            errors.push(format!(
                "netio.buffer_pool.buffer_size must be <= {}",
                MAX_DATAGRAM_SIZE
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
