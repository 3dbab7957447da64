//! Queue capacities for every cross-thread handoff a shard takes part in.
//!
//! Every queue is bounded. A full queue is never waited on from a shard
//! thread: forwarded datagrams are dropped, writes report `Blocked`,
//! application writes get `Backpressure`.

use serde::{Deserialize, Serialize};

/// Channel capacity configuration, in messages.
///
/// # Tuning Guidelines
///
/// - **inbound**: datagrams forwarded from sibling shards. Size for the
///   burst a sibling can receive between two polls of this shard.
/// - **write queue**: datagrams waiting for the writer thread.
/// - **completion**: writer thread back to shard. The writer blocks on this
///   one, so it bounds how far the writer can run ahead.
/// - **command**: application stream writes and closes.
/// - **proof**: finished signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// **Default:** 4096
    pub inbound_capacity: usize,

    /// **Default:** 4096
    pub write_queue_capacity: usize,

    /// **Default:** 4096
    pub completion_capacity: usize,

    /// **Default:** 2048
    pub command_capacity: usize,

    /// **Default:** 256
    pub proof_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 4096,
            write_queue_capacity: 4096,
            completion_capacity: 4096,
            command_capacity: 2048,
            proof_capacity: 256,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let minimums = [
            ("inbound_capacity", self.inbound_capacity, 16),
            ("write_queue_capacity", self.write_queue_capacity, 16),
            ("completion_capacity", self.completion_capacity, 16),
            ("command_capacity", self.command_capacity, 16),
            ("proof_capacity", self.proof_capacity, 1),
        ];
        for (name, value, min) in minimums {
            if value < min {
                errors.push(format!("channels.{} must be at least {}", name, min));
            }
        }

        if self.write_queue_capacity > 1_000_000 {
            tracing::warn!(
                capacity = self.write_queue_capacity,
                "write_queue_capacity is very large, may use excessive memory"
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(ChannelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_too_small() {
        let config = ChannelConfig {
            command_capacity: 4,
            proof_capacity: 0,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("command_capacity"));
    }
}
