//! Node identity: a stable 256-bit id derived from the platform peer id.

use std::fmt;

use sha2::{Digest, Sha256};

/// Stable 64-bit participant identity assigned by the session platform.
pub type PeerId = u64;

/// Size of a node id in bytes (SHA-256 output).
pub const NODE_ID_LEN: usize = 32;

/// 256-bit node identity.
///
/// Derived as `SHA-256(peer_id_le || salt)` so that every participant can
/// reconstruct any member's id locally. The derived `Ord` (bytewise,
/// most-significant first) is the tie-breaker for the whole allocation
/// protocol: the higher id wins every arbitration.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Derive the node id for `peer_id` under the given application salt.
    pub fn derive(peer_id: PeerId, salt: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(peer_id.to_le_bytes());
        hasher.update(salt.as_bytes());
        Self(hasher.finalize().into())
    }

    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Whether this node wins an arbitration against `other`.
    pub fn has_priority_over(&self, other: &NodeId) -> bool {
        self > other
    }

    /// Low 24 bits of the id (last three bytes, least-significant last).
    /// Seeds the candidate-address generator so nodes start probing at
    /// well-spread positions in the subnet.
    pub fn low24(&self) -> u32 {
        u32::from(self.0[NODE_ID_LEN - 1])
            | u32::from(self.0[NODE_ID_LEN - 2]) << 8
            | u32::from(self.0[NODE_ID_LEN - 3]) << 16
    }
}

impl fmt::Display for NodeId {
    /// Abbreviated hex form (first eight bytes) for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}
