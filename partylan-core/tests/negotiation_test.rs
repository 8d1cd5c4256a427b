//! End-to-end negotiation scenarios over the in-memory session.

mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use common::{free_host, now_ms, MemHub, TestNode};
use partylan_core::{Frame, NodeId, SessionTransport, VpnConfig};

fn in_subnet(ip: Ipv4Addr, config: &VpnConfig) -> bool {
    let host_mask = !u32::from(config.subnet_mask);
    let host = u32::from(ip) & host_mask;
    (u32::from(ip) & u32::from(config.subnet_mask))
        == (u32::from(config.virtual_subnet) & u32::from(config.subnet_mask))
        && host != 0
        && host != host_mask
}

#[tokio::test(start_paused = true)]
async fn singleton_claims_an_address() {
    let hub = MemHub::new();
    let node = TestNode::new(&hub, 101, VpnConfig::default());

    node.bridge.start().await.unwrap();
    assert!(node.bridge.is_running());
    assert!(node.bridge.local_virtual_ip().is_none());

    tokio::time::sleep(Duration::from_millis(600)).await;

    let config = VpnConfig::default();
    let ip = node.bridge.local_virtual_ip().expect("should be stable");
    assert!(in_subnet(ip, &config), "{ip} outside subnet");

    // The interface was configured and brought up.
    let tun = node.tun();
    assert_eq!(tun.device.assigned_addr(), Some((ip, config.subnet_mask)));
    assert!(tun.device.is_up());
    // 1200-byte transport limit minus encapsulation and margin.
    assert_eq!(tun.device.mtu(), Some(1150));

    let table = node.bridge.routing_table();
    assert_eq!(table.len(), 1);
    assert!(table[0].is_local);
    assert_eq!(table[0].virtual_ip, ip);

    node.bridge.stop().await;
    assert!(!node.bridge.is_running());
    assert!(node.bridge.local_virtual_ip().is_none());
    assert!(node.bridge.routing_table().is_empty());
}

#[tokio::test(start_paused = true)]
async fn two_nodes_claim_distinct_addresses() {
    let hub = MemHub::new();
    let a = TestNode::new(&hub, 101, VpnConfig::default());
    let b = TestNode::new(&hub, 102, VpnConfig::default());

    a.bridge.start().await.unwrap();
    b.bridge.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let ip_a = a.bridge.local_virtual_ip().expect("a should be stable");
    let ip_b = b.bridge.local_virtual_ip().expect("b should be stable");
    assert_ne!(ip_a, ip_b);

    // Both ended up with the full routing table.
    for node in [&a, &b] {
        let mut ips: Vec<Ipv4Addr> = node
            .bridge
            .routing_table()
            .iter()
            .map(|entry| entry.virtual_ip)
            .collect();
        ips.sort();
        let mut expected = vec![ip_a, ip_b];
        expected.sort();
        assert_eq!(ips, expected);
    }

    a.bridge.stop().await;
    b.bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn five_nodes_converge_to_unique_addresses() {
    let hub = MemHub::new();
    let nodes: Vec<TestNode> = (0..5)
        .map(|i| TestNode::new(&hub, 76561198000000000 + i, VpnConfig::default()))
        .collect();

    for node in &nodes {
        node.bridge.start().await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut ips = Vec::new();
    for node in &nodes {
        let ip = node.bridge.local_virtual_ip().expect("should be stable");
        assert!(!ips.contains(&ip), "duplicate address {ip}");
        ips.push(ip);
    }

    for node in &nodes {
        assert_eq!(node.bridge.routing_table().len(), nodes.len());
    }

    for node in &nodes {
        node.bridge.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn negotiation_is_deterministic_for_a_given_identity() {
    // Same peer id and salt, fresh sessions: same outcome.
    let mut claimed = Vec::new();
    for _ in 0..2 {
        let hub = MemHub::new();
        let node = TestNode::new(&hub, 4242, VpnConfig::default());
        node.bridge.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        claimed.push(node.bridge.local_virtual_ip().unwrap());
        node.bridge.stop().await;
    }
    assert_eq!(claimed[0], claimed[1]);
}

#[tokio::test(start_paused = true)]
async fn restart_claims_again_with_a_fresh_device() {
    let hub = MemHub::new();
    let node = TestNode::new(&hub, 101, VpnConfig::default());

    node.bridge.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    let first = node.bridge.local_virtual_ip().unwrap();
    node.bridge.stop().await;

    node.bridge.start().await.unwrap();
    assert!(node.bridge.is_running());
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(node.bridge.local_virtual_ip(), Some(first));
    node.bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn double_start_is_rejected() {
    let hub = MemHub::new();
    let node = TestNode::new(&hub, 101, VpnConfig::default());

    node.bridge.start().await.unwrap();
    assert!(node.bridge.start().await.is_err());
    node.bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn route_updates_are_idempotent_and_filtered() {
    let hub = MemHub::new();
    let node = TestNode::new(&hub, 101, VpnConfig::default());
    node.bridge.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    let local = node.bridge.local_virtual_ip().unwrap();

    let peer = hub.join(555, 1200);
    let ip_one = free_host(local, 50);
    let ip_two = free_host(local, 60);
    let update = Frame::RouteUpdate {
        routes: vec![
            (555, ip_one),
            (556, ip_two),
            // Foreign subnet: must be ignored.
            (557, Ipv4Addr::new(192, 168, 1, 5)),
            // Our own peer id: must be ignored.
            (node.peer, free_host(local, 70)),
        ],
    };
    peer.send(node.peer, update.encode().unwrap(), true).await.unwrap();
    peer.send(node.peer, update.encode().unwrap(), true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let table = node.bridge.routing_table();
    assert_eq!(table.len(), 3); // local + the two valid entries
    for ip in [ip_one, ip_two] {
        assert_eq!(
            table
                .iter()
                .filter(|entry| entry.virtual_ip == ip)
                .count(),
            1
        );
    }
    assert!(table
        .iter()
        .all(|entry| entry.virtual_ip != Ipv4Addr::new(192, 168, 1, 5)));

    node.bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_subnet_stops_the_bridge() {
    let hub = MemHub::new();
    // Two usable hosts only.
    let config = VpnConfig {
        virtual_subnet: Ipv4Addr::new(10, 9, 9, 0),
        subnet_mask: Ipv4Addr::new(255, 255, 255, 252),
        ..VpnConfig::default()
    };
    let node = TestNode::new(&hub, 101, config);

    // A defender with the highest possible node id contests every probe.
    let defender = hub.join(999, 1200);
    let strongest = NodeId::from_bytes([0xff; 32]);
    tokio::spawn(async move {
        loop {
            for (from, bytes) in defender.recv_batch(64).await {
                if let Ok(Frame::ProbeRequest { candidate, .. }) = Frame::decode(&bytes) {
                    let response = Frame::ProbeResponse {
                        conflicting: candidate,
                        holder: strongest,
                        last_heartbeat_ms: now_ms(),
                    };
                    let _ = defender.send(from, response.encode().unwrap(), true).await;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    node.bridge.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(!node.bridge.is_running());
    assert!(node.bridge.local_virtual_ip().is_none());
}
