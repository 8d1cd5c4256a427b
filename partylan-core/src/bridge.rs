//! VPN bridge: the composition root gluing TUN ↔ session transport.
//!
//! Owns every subsystem (negotiator, route table, node table, pumps) and
//! exposes the control surface used by the service frontend. Outbound
//! frames read from the TUN device are encapsulated and dispatched by
//! destination; inbound IP_PACKET frames are delivered locally, relayed
//! one hop, or dropped.

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use partylan_proto::{Frame, NodeId, PeerId};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::VpnConfig;
use crate::dispatcher;
use crate::error::VpnError;
use crate::lease::{unix_millis, NodeInfo, NodeTable};
use crate::negotiator::{Command, Negotiator};
use crate::packet;
use crate::routes::{RouteEntry, RouteTable};
use crate::stats::{StatsSnapshot, VpnStats};
use crate::transport::SessionTransport;
use crate::tun::TunDevice;

/// Opens a virtual NIC with a name hint and initial MTU. The bridge
/// invokes this on every `start` so a stopped bridge can be restarted
/// with a fresh device.
pub type TunFactory =
    Box<dyn Fn(&str, u16) -> io::Result<Arc<dyn TunDevice>> + Send + Sync>;

const TUN_READ_BUFFER: usize = 16384;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct VpnBridge {
    inner: Arc<BridgeInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct BridgeInner {
    pub(crate) config: VpnConfig,
    pub(crate) transport: Arc<dyn SessionTransport>,
    tun_factory: TunFactory,
    tun: Mutex<Option<Arc<dyn TunDevice>>>,
    negotiator: Mutex<Negotiator>,
    pub(crate) routes: RouteTable,
    pub(crate) nodes: NodeTable,
    pub(crate) stats: VpnStats,
    pub(crate) running: AtomicBool,
    local_ip: AtomicU32,
    local_node: NodeId,
}

impl VpnBridge {
    pub fn new(
        config: VpnConfig,
        transport: Arc<dyn SessionTransport>,
        tun_factory: TunFactory,
    ) -> Self {
        let local_node = NodeId::derive(transport.local_peer_id(), &config.app_secret_salt);
        info!(node = %local_node, "derived local node id");
        let negotiator = Negotiator::new(
            local_node,
            config.virtual_subnet,
            config.subnet_mask,
            config.probe_timeout,
            config.heartbeat_expiry,
        );
        let nodes = NodeTable::new(config.lease_expiry);
        Self {
            inner: Arc::new(BridgeInner {
                config,
                transport,
                tun_factory,
                tun: Mutex::new(None),
                negotiator: Mutex::new(negotiator),
                routes: RouteTable::new(),
                nodes,
                stats: VpnStats::default(),
                running: AtomicBool::new(false),
                local_ip: AtomicU32::new(0),
                local_node,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bring the VPN up: open the virtual NIC, start address negotiation
    /// and the pump tasks. Returns once the tasks are running; the
    /// address is assigned asynchronously when negotiation settles.
    pub async fn start(&self) -> Result<(), VpnError> {
        let inner = &self.inner;
        if inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(VpnError::AlreadyRunning);
        }
        if u32::from(inner.config.subnet_mask) == 0 {
            inner.running.store(false, Ordering::Release);
            return Err(VpnError::InvalidSubnet);
        }

        let mtu = packet::calculate_tun_mtu(
            inner.transport.max_unfragmented_payload(),
            inner.config.default_mtu,
        );
        let tun = match (inner.tun_factory)(&inner.config.tun_device_name, mtu) {
            Ok(tun) => tun,
            Err(error) => {
                inner.running.store(false, Ordering::Release);
                return Err(VpnError::Tun(error));
            }
        };
        if let Err(error) = tun.set_mtu(mtu) {
            inner.running.store(false, Ordering::Release);
            return Err(VpnError::Tun(error));
        }
        info!(device = %tun.name(), mtu, "virtual interface ready");
        *inner.tun.lock().unwrap() = Some(tun);

        let commands = inner.with_negotiator(|neg| neg.start(Instant::now()));
        inner.execute(commands).await;

        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(tokio::spawn(outbound_pump(inner.clone())));
            tasks.push(tokio::spawn(dispatcher::run(inner.clone())));
            tasks.push(tokio::spawn(lease_task(inner.clone())));
        }

        info!("vpn bridge started");
        Ok(())
    }

    /// Tear the VPN down: stop the tasks, release the device, clear all
    /// learned state. Tasks are given a bounded grace period, then
    /// aborted.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(tun) = inner.tun.lock().unwrap().take() {
            tun.close();
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        inner.routes.clear();
        inner.nodes.clear();
        inner.with_negotiator(|neg| neg.reset());
        info!("vpn bridge stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Negotiated virtual address, once Stable.
    pub fn local_virtual_ip(&self) -> Option<Ipv4Addr> {
        match self.inner.local_ip.load(Ordering::Acquire) {
            0 => None,
            ip => Some(Ipv4Addr::from(ip)),
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.inner.local_node
    }

    pub fn tun_device_name(&self) -> Option<String> {
        self.inner
            .tun
            .lock()
            .unwrap()
            .as_ref()
            .map(|tun| tun.name())
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn routing_table(&self) -> Vec<RouteEntry> {
        self.inner.routes.snapshot()
    }

    /// Session callback: a member joined. A Stable node introduces
    /// itself and shares its routing table so the newcomer converges
    /// without waiting for the next beacon.
    pub async fn on_peer_joined(&self, peer: PeerId) {
        let inner = &self.inner;
        info!(peer, "peer joined session");
        if !inner.running.load(Ordering::Acquire) {
            return;
        }
        let Some(address) = inner.with_negotiator(|neg| neg.local_ip()) else {
            return;
        };

        let announce = Frame::AddressAnnounce {
            address,
            announcer: inner.local_node,
        };
        if let Ok(bytes) = announce.encode() {
            if inner.transport.send(peer, bytes, true).await.is_err() {
                inner.stats.record_dropped();
            }
        }
        if let Ok(bytes) = inner.routes.to_route_update().encode() {
            let _ = inner.transport.send(peer, bytes, true).await;
        }
    }

    /// Session callback: a member left. Its routes are removed, its node
    /// registration dropped, and its address returned to the free pool.
    pub async fn on_peer_left(&self, peer: PeerId) {
        let inner = &self.inner;
        info!(peer, "peer left session");
        for entry in inner.routes.remove_for_peer(peer) {
            inner.nodes.unregister(&entry.node_id);
            inner.with_negotiator(|neg| neg.mark_unused(entry.virtual_ip));
        }
    }
}

impl BridgeInner {
    fn tun(&self) -> Option<Arc<dyn TunDevice>> {
        self.tun.lock().unwrap().clone()
    }

    /// Run a closure under the negotiator lock, then mirror the
    /// negotiator's stable address into the data-plane atomic so the
    /// pumps never read stale ownership.
    pub(crate) fn with_negotiator<R>(&self, f: impl FnOnce(&mut Negotiator) -> R) -> R {
        let mut negotiator = self.negotiator.lock().unwrap();
        let result = f(&mut negotiator);
        let ip = negotiator.local_ip().map(u32::from).unwrap_or(0);
        self.local_ip.store(ip, Ordering::Release);
        result
    }

    /// Perform the side effects requested by the negotiator. Runs with
    /// no lock held; send failures are counted, not surfaced.
    pub(crate) async fn execute(&self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::SendTo {
                    peer,
                    frame,
                    reliable,
                } => {
                    let Ok(bytes) = frame.encode() else {
                        self.stats.record_dropped();
                        continue;
                    };
                    if self.transport.send(peer, bytes, reliable).await.is_err() {
                        self.stats.record_dropped();
                    }
                }
                Command::Broadcast { frame, reliable } => {
                    if let Ok(bytes) = frame.encode() {
                        self.transport.broadcast(bytes, reliable).await;
                    }
                }
                Command::Claimed { address } => self.on_claimed(address).await,
                Command::Failed => {
                    error!("address negotiation failed, stopping data plane");
                    self.teardown();
                }
            }
        }
    }

    /// Negotiation settled: configure the interface, publish our own
    /// route, and start renewing the lease.
    async fn on_claimed(&self, address: Ipv4Addr) {
        let Some(tun) = self.tun() else {
            return;
        };
        let configured = tun
            .set_ipv4(address, self.config.subnet_mask)
            .and_then(|()| tun.bring_up());
        if let Err(error) = configured {
            error!(%error, "failed to configure tun address");
            self.teardown();
            return;
        }

        let local_peer = self.transport.local_peer_id();
        let display_name = self.transport.display_name(local_peer);
        info!(%address, "virtual address assigned");

        self.routes.upsert(RouteEntry {
            virtual_ip: address,
            peer_id: local_peer,
            node_id: self.local_node,
            display_name: display_name.clone(),
            is_local: true,
        });
        self.nodes.register(NodeInfo {
            node_id: self.local_node,
            peer_id: local_peer,
            virtual_ip: address,
            last_heartbeat: Instant::now(),
            display_name,
            is_local: true,
        });
        self.broadcast_route_update().await;
    }

    async fn broadcast_route_update(&self) {
        match self.routes.to_route_update().encode() {
            Ok(bytes) => self.transport.broadcast(bytes, true).await,
            Err(_) => warn!("routing table too large for a single update frame"),
        }
    }

    /// Demultiplex one inbound overlay frame. Malformed frames and
    /// unknown types are dropped silently.
    pub(crate) async fn handle_frame(&self, sender: PeerId, data: &[u8]) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(error) => {
                debug!(peer = sender, %error, "dropping undecodable frame");
                return;
            }
        };

        match frame {
            Frame::IpPacket {
                sender: origin,
                packet,
            } => self.handle_ip_packet(sender, origin, packet).await,
            Frame::RouteUpdate { routes } => self.apply_route_update(routes),
            Frame::ProbeRequest {
                candidate,
                requester,
            } => {
                let now = Instant::now();
                let now_ms = unix_millis();
                let commands = self.with_negotiator(|neg| {
                    neg.handle_probe_request(candidate, requester, sender, now, now_ms)
                });
                self.execute(commands).await;
            }
            Frame::ProbeResponse {
                conflicting,
                holder,
                last_heartbeat_ms,
            } => {
                self.with_negotiator(|neg| {
                    neg.handle_probe_response(conflicting, holder, last_heartbeat_ms, sender)
                });
            }
            Frame::AddressAnnounce { address, announcer } => {
                self.handle_address_announce(sender, address, announcer).await;
            }
            Frame::ForcedRelease { address, winner } => {
                let now = Instant::now();
                let commands =
                    self.with_negotiator(|neg| neg.handle_forced_release(address, winner, now));
                self.execute(commands).await;
            }
            Frame::Heartbeat { address, node, .. } => {
                let name = self.transport.display_name(sender);
                let is_new =
                    self.nodes
                        .observe_heartbeat(node, sender, address, name, Instant::now());
                self.with_negotiator(|neg| neg.mark_used(address));
                if is_new {
                    debug!(node = %node, ip = %address, "learned node from heartbeat");
                }
            }
        }
    }

    async fn handle_address_announce(
        &self,
        sender: PeerId,
        address: Ipv4Addr,
        announcer: NodeId,
    ) {
        debug!(ip = %address, node = %announcer, "received address announce");
        // Node ids are derivable from the peer identity; an announce
        // whose id doesn't match its sender can't be arbitrated honestly.
        let expected = NodeId::derive(sender, &self.config.app_secret_salt);
        if announcer != expected {
            warn!(peer = sender, "announce with mismatched node id, ignoring");
            return;
        }
        let now = Instant::now();
        let commands = self
            .with_negotiator(|neg| neg.handle_address_announce(address, announcer, sender, now));
        self.execute(commands).await;

        // If the announce collided with our stable address and we won,
        // the announcer is about to reselect; keep our own route.
        if self.local_ip.load(Ordering::Acquire) == u32::from(address) {
            return;
        }

        let display_name = self.transport.display_name(sender);
        let is_new = self.routes.upsert(RouteEntry {
            virtual_ip: address,
            peer_id: sender,
            node_id: announcer,
            display_name,
            is_local: false,
        });
        self.with_negotiator(|neg| neg.mark_used(address));
        if is_new {
            self.broadcast_route_update().await;
        }
    }

    /// Merge a peer's routing table. Entries for the local peer, already
    /// known addresses, and foreign subnets are skipped; nothing is
    /// re-broadcast on receipt, which is what stops route storms.
    fn apply_route_update(&self, routes: Vec<(PeerId, Ipv4Addr)>) {
        let local_peer = self.transport.local_peer_id();
        let base = u32::from(self.config.virtual_subnet);
        let mask = u32::from(self.config.subnet_mask);

        for (peer, ip) in routes {
            if peer == local_peer || self.routes.contains(ip) {
                continue;
            }
            if u32::from(ip) & mask != base & mask {
                continue;
            }
            let node_id = NodeId::derive(peer, &self.config.app_secret_salt);
            let display_name = self.transport.display_name(peer);
            self.routes.upsert(RouteEntry {
                virtual_ip: ip,
                peer_id: peer,
                node_id,
                display_name,
                is_local: false,
            });
            self.with_negotiator(|neg| neg.mark_used(ip));
        }
    }

    /// Inbound data path: deliver to the local interface, relay one hop
    /// toward a third party, or drop.
    async fn handle_ip_packet(&self, sender: PeerId, origin: NodeId, packet: Bytes) {
        let Some(dst) = packet::dest_ip(&packet) else {
            self.stats.record_dropped();
            return;
        };

        let local = self.local_ip.load(Ordering::Acquire);
        let for_us = local != 0 && u32::from(dst) == local;
        if for_us
            || packet::is_broadcast(dst, self.config.virtual_subnet, self.config.subnet_mask)
        {
            let Some(tun) = self.tun() else {
                self.stats.record_dropped();
                return;
            };
            match tun.send(&packet).await {
                Ok(_) => self.stats.record_received(packet.len() as u64),
                Err(error) => {
                    warn!(%error, "tun write failed");
                    self.stats.record_dropped();
                }
            }
            return;
        }

        // Relay hop: known third party only, never back to the sender.
        match self.routes.lookup(dst) {
            Some(entry) if !entry.is_local && entry.peer_id != sender => {
                let frame = Frame::IpPacket {
                    sender: origin,
                    packet,
                };
                let Ok(bytes) = frame.encode() else {
                    self.stats.record_dropped();
                    return;
                };
                if self
                    .transport
                    .send(entry.peer_id, bytes, false)
                    .await
                    .is_err()
                {
                    self.stats.record_dropped();
                }
            }
            _ => self.stats.record_dropped(),
        }
    }

    /// Outbound data path: dispatch one IPv4 frame read from the TUN
    /// device to its owner, or fan it out for broadcast destinations.
    async fn forward_outbound(&self, packet: &[u8]) {
        let Some(dst) = packet::dest_ip(packet) else {
            self.stats.record_dropped();
            return;
        };

        if packet::is_broadcast(dst, self.config.virtual_subnet, self.config.subnet_mask) {
            let frame = Frame::IpPacket {
                sender: self.local_node,
                packet: Bytes::copy_from_slice(packet),
            };
            let Ok(bytes) = frame.encode() else {
                self.stats.record_dropped();
                return;
            };
            self.transport.broadcast(bytes, false).await;
            let members = self.transport.members().len() as u64;
            self.stats.record_sent(members, members * packet.len() as u64);
            return;
        }

        match self.routes.lookup(dst) {
            Some(entry) if !entry.is_local => {
                let frame = Frame::IpPacket {
                    sender: self.local_node,
                    packet: Bytes::copy_from_slice(packet),
                };
                let Ok(bytes) = frame.encode() else {
                    self.stats.record_dropped();
                    return;
                };
                match self.transport.send(entry.peer_id, bytes, false).await {
                    Ok(()) => self.stats.record_sent(1, packet.len() as u64),
                    Err(_) => self.stats.record_dropped(),
                }
            }
            _ => self.stats.record_dropped(),
        }
    }

    /// Fatal-path shutdown from inside a task: stop the pumps and wipe
    /// state. `is_running` turns false; the frontend observes the outage
    /// through the control surface.
    fn teardown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(tun) = self.tun.lock().unwrap().take() {
            tun.close();
        }
        self.routes.clear();
        self.nodes.clear();
        self.local_ip.store(0, Ordering::Release);
    }
}

/// Reads whole IPv4 frames from the TUN device and forwards them to the
/// session transport until shutdown.
async fn outbound_pump(inner: Arc<BridgeInner>) {
    debug!("tun read task started");
    let Some(tun) = inner.tun() else {
        return;
    };
    let mut buf = vec![0u8; TUN_READ_BUFFER];

    while inner.running.load(Ordering::Acquire) {
        let n = match tun.recv(&mut buf).await {
            Ok(n) if n > 0 => n,
            Ok(_) => continue,
            Err(error) => {
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                warn!(%error, "tun read failed");
                inner.stats.record_dropped();
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        inner.forward_outbound(&buf[..n]).await;
    }
    debug!("tun read task stopped");
}

/// Once per second: send the liveness beacon when due and evict lapsed
/// leases, freeing their routes and addresses.
async fn lease_task(inner: Arc<BridgeInner>) {
    debug!("lease task started");
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_beacon = Instant::now();

    while inner.running.load(Ordering::Acquire) {
        ticker.tick().await;
        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        let local = inner.local_ip.load(Ordering::Acquire);
        if local != 0 && last_beacon.elapsed() >= inner.config.heartbeat_interval {
            let beacon = Frame::Heartbeat {
                address: Ipv4Addr::from(local),
                node: inner.local_node,
                timestamp_ms: unix_millis(),
            };
            if let Ok(bytes) = beacon.encode() {
                inner.transport.broadcast(bytes, true).await;
            }
            last_beacon = Instant::now();
        }

        for info in inner.nodes.evict_expired(Instant::now()) {
            warn!(node = %info.node_id, ip = %info.virtual_ip, "lease expired, evicting node");
            inner.routes.remove(info.virtual_ip);
            inner.with_negotiator(|neg| neg.mark_unused(info.virtual_ip));
        }
    }
    debug!("lease task stopped");
}
