//! Virtual-IP routing table.
//!
//! One guarded map from virtual address to owning peer. Mutations are
//! serialized; readers clone the entry they need under the same short
//! guard. Serialization to ROUTE_UPDATE happens against a snapshot so
//! the lock is never held across a transport send.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use partylan_proto::{Frame, NodeId, PeerId};
use tracing::debug;

/// One mapping of a virtual address to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub virtual_ip: Ipv4Addr,
    pub peer_id: PeerId,
    pub node_id: NodeId,
    pub display_name: String,
    pub is_local: bool,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Mutex<HashMap<Ipv4Addr, RouteEntry>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the route for `entry.virtual_ip`. A peer holds
    /// at most one address, so any previous entry for the same peer at a
    /// different address is evicted first. Returns `true` when the
    /// address was not routed before.
    pub fn upsert(&self, entry: RouteEntry) -> bool {
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|ip, existing| {
            existing.peer_id != entry.peer_id || *ip == entry.virtual_ip
        });
        debug!(ip = %entry.virtual_ip, peer = entry.peer_id, name = %entry.display_name, "route updated");
        routes.insert(entry.virtual_ip, entry).is_none()
    }

    pub fn remove(&self, ip: Ipv4Addr) -> Option<RouteEntry> {
        self.routes.lock().unwrap().remove(&ip)
    }

    /// Drop every route owned by `peer`, returning the removed entries
    /// so the caller can release the addresses and node registrations.
    pub fn remove_for_peer(&self, peer: PeerId) -> Vec<RouteEntry> {
        let mut routes = self.routes.lock().unwrap();
        let ips: Vec<Ipv4Addr> = routes
            .iter()
            .filter(|(_, entry)| entry.peer_id == peer)
            .map(|(ip, _)| *ip)
            .collect();
        ips.iter().filter_map(|ip| routes.remove(ip)).collect()
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<RouteEntry> {
        self.routes.lock().unwrap().get(&ip).cloned()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.routes.lock().unwrap().contains_key(&ip)
    }

    /// All entries, ordered by address.
    pub fn snapshot(&self) -> Vec<RouteEntry> {
        let mut entries: Vec<RouteEntry> =
            self.routes.lock().unwrap().values().cloned().collect();
        entries.sort_by_key(|entry| u32::from(entry.virtual_ip));
        entries
    }

    pub fn len(&self) -> usize {
        self.routes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.routes.lock().unwrap().clear();
    }

    /// Serialize the whole table as a ROUTE_UPDATE frame.
    pub fn to_route_update(&self) -> Frame {
        let routes = self
            .snapshot()
            .into_iter()
            .map(|entry| (entry.peer_id, entry.virtual_ip))
            .collect();
        Frame::RouteUpdate { routes }
    }
}
