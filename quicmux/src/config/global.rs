//! Global server configuration.
//!
//! Settings that apply server-wide: network binding, the proof key, runtime,
//! logging, and the per-shard subsystems.

use crate::channel_config::ChannelConfig;
use crate::netio::NetIoConfig;
use crate::scheduler::SchedulerConfig;
use crate::telemetry::TelemetryConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Network binding configuration
    pub network: NetworkConfig,

    /// Proof signing key
    pub tls: TlsConfig,

    /// Main runtime (telemetry, signals, blocking pool) configuration
    pub runtime: RuntimeConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Shard and socket configuration
    pub netio: NetIoConfig,

    /// Channel capacity configuration
    pub channels: ChannelConfig,

    /// Alarm scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Telemetry configuration
    pub telemetry: TelemetryConfig,
}

impl GlobalConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let sections = [
            self.network.validate(),
            self.tls.validate(),
            self.runtime.validate(),
            self.netio.validate(),
            self.channels.validate(),
            self.scheduler.validate(),
            self.telemetry.validate(),
        ];
        for result in sections {
            if let Err(e) = result {
                errors.extend(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Network binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host address to bind to.
    ///
    /// Examples:
    /// - `"0.0.0.0"` - Bind to all IPv4 interfaces
    /// - `"::"` - Bind to all IPv6 interfaces
    /// - `"127.0.0.1"` - Localhost only (testing)
    ///
    /// **Default:** `"0.0.0.0"`
    pub host: String,

    /// UDP port every shard binds. `0` lets the OS pick one.
    ///
    /// **Default:** `4433`
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4433,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        if self.host.parse::<IpAddr>().is_err() {
            return Err(vec![format!("Invalid host address: {}", self.host)]);
        }
        if self.port == 0 {
            tracing::warn!("port=0 will bind to a random port assigned by the OS");
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("Invalid host address: {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Proof signing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM private key used to sign server config proofs (RSA or EC).
    ///
    /// When unset the server runs insecure and every proof request fails.
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        if let Some(key) = &self.key_path {
            if !key.exists() {
                return Err(vec![format!("Private key file not found: {}", key.display())]);
            }
        }
        Ok(())
    }
}

/// Runtime configuration for the main multi-thread executor.
///
/// Shards do not run here; each has its own current-thread runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// **Default:** 2
    pub worker_threads: usize,

    /// Blocking pool size. Off-shard proof signing runs here.
    ///
    /// **Default:** 64
    pub max_blocking_threads: usize,

    /// **Default:** `"quicmux-rt"`
    pub thread_name: String,

    /// **Default:** 2 MB
    pub thread_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            max_blocking_threads: 64,
            thread_name: "quicmux-rt".to_string(),
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.worker_threads == 0 {
            errors.push("worker_threads must be > 0".to_string());
        }

        if self.worker_threads > 1024 {
            errors.push("worker_threads is unreasonably high (> 1024)".to_string());
        }

        if self.max_blocking_threads == 0 {
            errors.push("max_blocking_threads must be > 0".to_string());
        }

        if self.thread_stack_size < 128 * 1024 {
            errors.push("thread_stack_size too small (< 128 KB)".to_string());
        }

        if self.thread_stack_size > 64 * 1024 * 1024 {
            errors.push("thread_stack_size too large (> 64 MB)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    ///
    /// **Default:** `Info`
    pub level: LogLevel,

    /// **Default:** `false`
    pub json_format: bool,

    /// Disable when logging to files or non-TTY outputs.
    ///
    /// **Default:** `true`
    pub enable_colors: bool,

    /// **Default:** `false`
    pub include_file_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            enable_colors: true,
            include_file_line: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}
