//! quicmux: sharded UDP connection multiplexing and alarm scheduling for a
//! pluggable QUIC engine.
//!
//! The binary in main.rs serves the loopback engine; everything it uses is
//! exposed here for embedding, benchmarks and integration tests.

pub mod channel_config;
pub mod client;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod handle_table;
pub mod netio;
pub mod proof;
pub mod routing;
pub mod runtime;
pub mod scheduler;
pub mod shard;
pub mod telemetry;
