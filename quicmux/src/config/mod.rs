//! Server configuration module.
//!
//! # Architecture
//!
//! - **Global Configuration:** network binding, proof key, runtime, logging,
//!   shard I/O, channel capacities, alarm scheduler, telemetry
//! - **Loopback Configuration:** settings for the demonstration engine the
//!   binary serves
//!
//! # Example
//!
//! ```toml
//! [global.network]
//! host = "0.0.0.0"
//! port = 4433
//!
//! [global.netio]
//! shards = 4
//!
//! [global.scheduler]
//! max_premature_rearms = 3
//!
//! [loopback]
//! idle_timeout_ms = 30000
//! ```

pub mod global;
pub mod loader;

#[cfg(test)]
mod tests;

pub use global::{GlobalConfig, LogLevel, LoggingConfig, NetworkConfig, RuntimeConfig, TlsConfig};
pub use loader::{load_config, CliArgs};

use crate::engine::LoopbackConfig;
use crate::shard::ShardSetConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Master server configuration composing all subsystems.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub global: GlobalConfig,

    pub loopback: LoopbackConfig,
}

impl ServerConfig {
    /// Validate the entire configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.global.validate() {
            errors.extend(e);
        }

        if let Err(e) = self.loopback.validate() {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Address the shards bind to.
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.global.network.socket_addr()
    }

    /// The slice of settings every shard is started with.
    pub fn shard_set(&self) -> ShardSetConfig {
        ShardSetConfig {
            netio: self.global.netio.clone(),
            channels: self.global.channels.clone(),
            scheduler: self.global.scheduler.clone(),
        }
    }
}
