//! Peer roster entries.

use serde::{Deserialize, Serialize};

/// Numeric peer identifier, unique within a roster.
pub type PeerId = u32;

/// A known peer and where to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Host name or IP literal.
    pub address: String,
    pub port: u16,
}

impl PeerRecord {
    pub fn new(id: PeerId, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
        }
    }

    /// `address:port`, bracketing IPv6 literals.
    pub fn full_address(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}
