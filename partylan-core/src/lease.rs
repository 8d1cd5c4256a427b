//! Liveness tracking and lease expiry.
//!
//! Every node renews its address lease with periodic heartbeats. This
//! table records the last beacon per node id; the bridge's lease task
//! scans it once per second and evicts anything silent for longer than
//! the lease expiry, freeing the route and the address.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use partylan_proto::{NodeId, PeerId};
use tokio::time::Instant;

/// Milliseconds since the Unix epoch, as carried in heartbeat and probe
/// response frames.
pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Liveness record for one node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub peer_id: PeerId,
    pub virtual_ip: Ipv4Addr,
    pub last_heartbeat: Instant,
    pub display_name: String,
    pub is_local: bool,
}

#[derive(Debug)]
pub struct NodeTable {
    nodes: Mutex<HashMap<NodeId, NodeInfo>>,
    lease_expiry: Duration,
}

impl NodeTable {
    pub fn new(lease_expiry: Duration) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            lease_expiry,
        }
    }

    /// Register a node explicitly (the local node after negotiation).
    pub fn register(&self, info: NodeInfo) {
        self.nodes.lock().unwrap().insert(info.node_id, info);
    }

    pub fn unregister(&self, node_id: &NodeId) -> Option<NodeInfo> {
        self.nodes.lock().unwrap().remove(node_id)
    }

    /// Refresh a node's lease from an incoming heartbeat, creating the
    /// record on first contact. Returns `true` for a new node.
    pub fn observe_heartbeat(
        &self,
        node_id: NodeId,
        peer_id: PeerId,
        virtual_ip: Ipv4Addr,
        display_name: String,
        now: Instant,
    ) -> bool {
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.get_mut(&node_id) {
            Some(info) => {
                info.last_heartbeat = now;
                info.virtual_ip = virtual_ip;
                false
            }
            None => {
                nodes.insert(
                    node_id,
                    NodeInfo {
                        node_id,
                        peer_id,
                        virtual_ip,
                        last_heartbeat: now,
                        display_name,
                        is_local: false,
                    },
                );
                true
            }
        }
    }

    /// Remove and return every remote node whose lease has lapsed.
    pub fn evict_expired(&self, now: Instant) -> Vec<NodeInfo> {
        let mut nodes = self.nodes.lock().unwrap();
        let expired: Vec<NodeId> = nodes
            .values()
            .filter(|info| {
                !info.is_local
                    && now.saturating_duration_since(info.last_heartbeat) >= self.lease_expiry
            })
            .map(|info| info.node_id)
            .collect();
        expired
            .iter()
            .filter_map(|node_id| nodes.remove(node_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.nodes.lock().unwrap().clear();
    }
}
