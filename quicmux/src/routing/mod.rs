//! Connection-id routing.
//!
//! The only header bytes this crate interprets: a short connection id prefix
//! used to pick the shard that owns a connection. Everything after it belongs
//! to the engine.

pub mod conn_id;


pub use conn_id::{conn_id_width, parse_connection_id, shard_for, ParseError, ParsedHeader};
