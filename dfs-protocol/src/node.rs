//! Node records published to the peer registry.

use serde::{Deserialize, Serialize};

/// A file server as seen by the registry.
///
/// `address` is the join key: registries index nodes by it and the
/// orchestrator dials it. Everything else is informational.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub port: u16,
    /// Unix timestamp (seconds) at which the node registered itself.
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub connected: bool,
    pub address: String,
}

impl Node {
    /// A node record carrying only its address.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}
