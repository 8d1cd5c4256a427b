//! In-memory session transport and TUN device for end-to-end tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use partylan_core::{PeerId, SessionTransport, TunDevice, TunFactory, VpnBridge, VpnConfig};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

/// Message hub connecting every in-memory transport of one test session.
/// Cheap to clone; all clones share the same peer registry.
#[derive(Clone, Default)]
pub struct MemHub {
    peers: Arc<Mutex<HashMap<PeerId, UnboundedSender<(PeerId, Bytes)>>>>,
}

impl MemHub {
    pub fn new() -> Self {
        // Show bridge logs under --nocapture; repeated init attempts are
        // harmless.
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self::default()
    }

    /// Register a peer and hand back its transport endpoint.
    pub fn join(&self, peer: PeerId, max_payload: usize) -> Arc<MemTransport> {
        let (tx, rx) = unbounded_channel();
        self.peers.lock().unwrap().insert(peer, tx);
        Arc::new(MemTransport {
            hub: self.clone(),
            peer,
            rx: tokio::sync::Mutex::new(rx),
            max_payload,
        })
    }

    /// Drop a peer; subsequent sends to it fail.
    pub fn leave(&self, peer: PeerId) {
        self.peers.lock().unwrap().remove(&peer);
    }

    fn deliver(&self, from: PeerId, to: PeerId, bytes: Bytes) -> io::Result<()> {
        let peers = self.peers.lock().unwrap();
        let tx = peers
            .get(&to)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown peer"))?;
        tx.send((from, bytes))
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "peer closed"))
    }

    fn members_except(&self, peer: PeerId) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self
            .peers
            .lock()
            .unwrap()
            .keys()
            .copied()
            .filter(|member| *member != peer)
            .collect();
        members.sort_unstable();
        members
    }
}

pub struct MemTransport {
    hub: MemHub,
    peer: PeerId,
    rx: tokio::sync::Mutex<UnboundedReceiver<(PeerId, Bytes)>>,
    max_payload: usize,
}

#[async_trait]
impl SessionTransport for MemTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer
    }

    fn display_name(&self, peer: PeerId) -> String {
        format!("peer-{peer}")
    }

    fn members(&self) -> Vec<PeerId> {
        self.hub.members_except(self.peer)
    }

    fn max_unfragmented_payload(&self) -> usize {
        self.max_payload
    }

    async fn send(&self, peer: PeerId, bytes: Bytes, _reliable: bool) -> io::Result<()> {
        self.hub.deliver(self.peer, peer, bytes)
    }

    async fn recv_batch(&self, max: usize) -> Vec<(PeerId, Bytes)> {
        let mut rx = self.rx.lock().await;
        let mut batch = Vec::new();
        while batch.len() < max {
            match rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }
        batch
    }
}

#[derive(Debug, Default)]
struct TunState {
    addr: Option<(Ipv4Addr, Ipv4Addr)>,
    mtu: Option<u16>,
    up: bool,
}

/// In-memory TUN: the test injects "application" packets and observes
/// what the bridge delivers to the "kernel".
pub struct MemTun {
    name: String,
    inbound: tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>,
    outbound: UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
    shutdown: Notify,
    state: Mutex<TunState>,
}

/// Test-side handle to one [`MemTun`].
pub struct TunHandle {
    pub device: Arc<MemTun>,
    pub inject: UnboundedSender<Vec<u8>>,
    pub delivered: tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>,
}

impl MemTun {
    pub fn create(name: &str) -> TunHandle {
        let (inject, inbound) = unbounded_channel();
        let (outbound, delivered) = unbounded_channel();
        let device = Arc::new(MemTun {
            name: name.to_string(),
            inbound: tokio::sync::Mutex::new(inbound),
            outbound,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            state: Mutex::new(TunState::default()),
        });
        TunHandle {
            device,
            inject,
            delivered: tokio::sync::Mutex::new(delivered),
        }
    }

    pub fn assigned_addr(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        self.state.lock().unwrap().addr
    }

    pub fn mtu(&self) -> Option<u16> {
        self.state.lock().unwrap().mtu
    }

    pub fn is_up(&self) -> bool {
        self.state.lock().unwrap().up
    }
}

#[async_trait]
impl TunDevice for MemTun {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_ipv4(&self, addr: Ipv4Addr, mask: Ipv4Addr) -> io::Result<()> {
        self.state.lock().unwrap().addr = Some((addr, mask));
        Ok(())
    }

    fn set_mtu(&self, mtu: u16) -> io::Result<()> {
        self.state.lock().unwrap().mtu = Some(mtu);
        Ok(())
    }

    fn bring_up(&self) -> io::Result<()> {
        self.state.lock().unwrap().up = true;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"));
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.shutdown.notified() => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"))
            }
            packet = inbound.recv() => match packet {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun closed")),
            }
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"));
        }
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"))?;
        Ok(packet.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}

/// One bridge wired to the hub, with a fresh [`MemTun`] per start.
pub struct TestNode {
    pub peer: PeerId,
    pub bridge: VpnBridge,
    pub transport: Arc<MemTransport>,
    tuns: Arc<Mutex<Vec<Arc<TunHandle>>>>,
}

impl TestNode {
    pub fn new(hub: &MemHub, peer: PeerId, config: VpnConfig) -> Self {
        let transport = hub.join(peer, 1200);
        let tuns: Arc<Mutex<Vec<Arc<TunHandle>>>> = Arc::new(Mutex::new(Vec::new()));
        let factory_tuns = tuns.clone();
        let factory: TunFactory = Box::new(move |name, _mtu| {
            let handle = Arc::new(MemTun::create(name));
            let device: Arc<dyn TunDevice> = handle.device.clone();
            factory_tuns.lock().unwrap().push(handle);
            Ok(device)
        });
        let bridge = VpnBridge::new(config, transport.clone(), factory);
        Self {
            peer,
            bridge,
            transport,
            tuns,
        }
    }

    /// Handle of the device the running bridge is using.
    pub fn tun(&self) -> Arc<TunHandle> {
        self.tuns
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("bridge not started")
    }
}

/// A host address in 10.0.0.0/24 that differs from `taken`, preferring
/// `.preferred`. Keeps fabricated peers clear of a bridge's own address.
pub fn free_host(taken: Ipv4Addr, preferred: u8) -> Ipv4Addr {
    if taken.octets()[3] == preferred {
        Ipv4Addr::new(10, 0, 0, preferred.wrapping_add(1).max(1))
    } else {
        Ipv4Addr::new(10, 0, 0, preferred)
    }
}

/// Milliseconds since the Unix epoch, for fabricated heartbeats.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Minimal IPv4 frame: 20-byte header, no options, given payload.
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64; // TTL
    packet[9] = 17; // UDP
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..].copy_from_slice(payload);
    packet
}
