//! Distributed address negotiation.
//!
//! Leaderless allocation: each node seeds a candidate from its own node
//! id, probes the session for conflicts, and resolves ties by "higher
//! node id wins". The state machine here is synchronous and returns
//! [`Command`]s for the caller to perform after releasing the lock, so
//! no transport send ever happens under the negotiator mutex.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use partylan_proto::{Frame, NodeId, PeerId};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendTo {
        peer: PeerId,
        frame: Frame,
        reliable: bool,
    },
    Broadcast {
        frame: Frame,
        reliable: bool,
    },
    /// Negotiation succeeded; the bridge configures the interface and
    /// publishes the mapping.
    Claimed { address: Ipv4Addr },
    /// Every offset in the subnet was contested or occupied; fatal.
    Failed,
}

/// A conflict response collected during the probe window.
#[derive(Debug, Clone)]
struct ConflictReport {
    node: NodeId,
    last_heartbeat_ms: i64,
    peer: PeerId,
}

#[derive(Debug)]
enum State {
    Idle,
    Probing {
        candidate: u32,
        deadline: Instant,
        conflicts: Vec<ConflictReport>,
    },
    Stable {
        address: u32,
    },
}

pub struct Negotiator {
    local_node: NodeId,
    base: u32,
    mask: u32,
    state: State,
    offset: u32,
    used: HashSet<u32>,
    probe_timeout: Duration,
    heartbeat_expiry_ms: i64,
}

impl Negotiator {
    pub fn new(
        local_node: NodeId,
        subnet: Ipv4Addr,
        mask: Ipv4Addr,
        probe_timeout: Duration,
        heartbeat_expiry: Duration,
    ) -> Self {
        Self {
            local_node,
            base: u32::from(subnet),
            mask: u32::from(mask),
            state: State::Idle,
            offset: 0,
            used: HashSet::new(),
            probe_timeout,
            heartbeat_expiry_ms: heartbeat_expiry.as_millis() as i64,
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node
    }

    /// Assigned address, only while Stable.
    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        match self.state {
            State::Stable { address } => Some(Ipv4Addr::from(address)),
            _ => None,
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self.state, State::Stable { .. })
    }

    /// Forget all negotiation state (bridge shutdown).
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.offset = 0;
        self.used.clear();
    }

    /// Record an address as occupied so candidate selection avoids it.
    pub fn mark_used(&mut self, ip: Ipv4Addr) {
        self.used.insert(u32::from(ip));
    }

    /// Return an address to the free pool (peer gone or lease expired).
    pub fn mark_unused(&mut self, ip: Ipv4Addr) {
        self.used.remove(&u32::from(ip));
    }

    /// Begin (or restart) negotiation: pick a candidate, broadcast a
    /// probe, and open the probe window.
    pub fn start(&mut self, now: Instant) -> Vec<Command> {
        if self.offset >= self.host_count() {
            warn!("address negotiation exhausted all {} offsets", self.host_count());
            self.state = State::Idle;
            return vec![Command::Failed];
        }

        let seed = self.candidate_for_offset(self.offset);
        let Some(candidate) = self.find_next_available(seed) else {
            warn!("no free address left in subnet");
            self.state = State::Idle;
            return vec![Command::Failed];
        };

        debug!(
            candidate = %Ipv4Addr::from(candidate),
            offset = self.offset,
            "probing candidate address"
        );
        self.state = State::Probing {
            candidate,
            deadline: now + self.probe_timeout,
            conflicts: Vec::new(),
        };

        vec![Command::Broadcast {
            frame: Frame::ProbeRequest {
                candidate: Ipv4Addr::from(candidate),
                requester: self.local_node,
            },
            reliable: true,
        }]
    }

    /// Check the probe window. Called from the dispatcher loop; a no-op
    /// unless Probing and past the deadline.
    pub fn poll(&mut self, now: Instant, now_ms: i64) -> Vec<Command> {
        let (candidate, conflicts) = match &mut self.state {
            State::Probing {
                candidate,
                deadline,
                conflicts,
            } if now >= *deadline => (*candidate, std::mem::take(conflicts)),
            _ => return Vec::new(),
        };
        let mut commands = Vec::new();
        for conflict in &conflicts {
            let heartbeat_age = now_ms - conflict.last_heartbeat_ms;
            if heartbeat_age < self.heartbeat_expiry_ms
                && conflict.node.has_priority_over(&self.local_node)
            {
                // An active responder outranks us: yield this candidate.
                debug!(
                    candidate = %Ipv4Addr::from(candidate),
                    winner = %conflict.node,
                    "lost probe arbitration, reselecting"
                );
                self.offset += 1;
                return self.start(now);
            }
            // Lower-priority or stale responders must surrender the
            // address once we claim it.
            commands.push(Command::SendTo {
                peer: conflict.peer,
                frame: Frame::ForcedRelease {
                    address: Ipv4Addr::from(candidate),
                    winner: self.local_node,
                },
                reliable: true,
            });
        }

        info!(address = %Ipv4Addr::from(candidate), "address negotiation succeeded");
        self.state = State::Stable { address: candidate };
        self.used.insert(candidate);
        commands.push(Command::Broadcast {
            frame: Frame::AddressAnnounce {
                address: Ipv4Addr::from(candidate),
                announcer: self.local_node,
            },
            reliable: true,
        });
        commands.push(Command::Claimed {
            address: Ipv4Addr::from(candidate),
        });
        commands
    }

    /// Another node probes `requested`. While we hold it (or probe it and
    /// outrank the requester) we assert ownership with a conflict
    /// response; a higher-priority probe for our in-flight candidate or
    /// our stable address makes us reselect.
    pub fn handle_probe_request(
        &mut self,
        requested: Ipv4Addr,
        requester: NodeId,
        sender: PeerId,
        now: Instant,
        now_ms: i64,
    ) -> Vec<Command> {
        let requested_u32 = u32::from(requested);
        let respond = |local_node: NodeId| Command::SendTo {
            peer: sender,
            frame: Frame::ProbeResponse {
                conflicting: requested,
                holder: local_node,
                last_heartbeat_ms: now_ms,
            },
            reliable: true,
        };

        match self.state {
            State::Stable { address } if requested_u32 == address => {
                // Assert ownership regardless of priority so the prober
                // learns the address is taken; a stronger prober still
                // displaces us.
                let mut commands = vec![respond(self.local_node)];
                if requester.has_priority_over(&self.local_node) {
                    warn!(address = %requested, "outranked by probing node, reselecting");
                    self.offset += 1;
                    commands.extend(self.start(now));
                }
                commands
            }
            State::Probing { candidate, .. } if requested_u32 == candidate => {
                if requester.has_priority_over(&self.local_node) {
                    debug!(candidate = %requested, "lost probe contention, reselecting");
                    self.offset += 1;
                    self.start(now)
                } else {
                    vec![respond(self.local_node)]
                }
            }
            _ => Vec::new(),
        }
    }

    /// A conflict response for our probe window. Responses for other
    /// addresses still mark the address as occupied.
    pub fn handle_probe_response(
        &mut self,
        conflicting: Ipv4Addr,
        holder: NodeId,
        last_heartbeat_ms: i64,
        sender: PeerId,
    ) {
        self.used.insert(u32::from(conflicting));
        if let State::Probing {
            candidate,
            ref mut conflicts,
            ..
        } = self.state
        {
            if u32::from(conflicting) == candidate {
                debug!(candidate = %conflicting, holder = %holder, "collected conflict response");
                conflicts.push(ConflictReport {
                    node: holder,
                    last_heartbeat_ms,
                    peer: sender,
                });
            }
        }
    }

    /// A peer announced an address. If it collides with our stable
    /// address the node ids arbitrate; otherwise just mark it used.
    pub fn handle_address_announce(
        &mut self,
        announced: Ipv4Addr,
        announcer: NodeId,
        sender: PeerId,
        now: Instant,
    ) -> Vec<Command> {
        if let State::Stable { address } = self.state {
            if u32::from(announced) == address {
                return if announcer.has_priority_over(&self.local_node) {
                    warn!(address = %announced, "address conflict with stronger node, reselecting");
                    self.offset += 1;
                    self.start(now)
                } else {
                    vec![Command::SendTo {
                        peer: sender,
                        frame: Frame::ForcedRelease {
                            address: announced,
                            winner: self.local_node,
                        },
                        reliable: true,
                    }]
                };
            }
        }
        self.used.insert(u32::from(announced));
        Vec::new()
    }

    /// A winner ordered us off an address. Only honored when it targets
    /// our current candidate or stable address and the winner outranks
    /// us; anything else (including addresses we no longer own) is a
    /// no-op.
    pub fn handle_forced_release(
        &mut self,
        released: Ipv4Addr,
        winner: NodeId,
        now: Instant,
    ) -> Vec<Command> {
        let released_u32 = u32::from(released);
        let ours = match self.state {
            State::Stable { address } => released_u32 == address,
            State::Probing { candidate, .. } => released_u32 == candidate,
            State::Idle => false,
        };
        if !ours || !winner.has_priority_over(&self.local_node) {
            return Vec::new();
        }

        warn!(address = %released, winner = %winner, "forced to release address, reselecting");
        self.offset += 1;
        self.state = State::Idle;
        self.start(now)
    }

    fn host_count(&self) -> u32 {
        let host_mask = !self.mask;
        host_mask.saturating_sub(1).max(1)
    }

    /// Deterministic candidate for an offset: hash the node id into the
    /// host range, shifted by `offset`.
    fn candidate_for_offset(&self, offset: u32) -> u32 {
        let hash = (self.local_node.low24().wrapping_add(offset)) & 0x00ff_ffff;
        let host = (hash % self.host_count()) + 1;
        (self.base & self.mask) | host
    }

    /// Scan forward from `start` for an address not in the used set,
    /// wrapping at the subnet's top host address. `None` when every host
    /// address is occupied.
    fn find_next_available(&self, start: u32) -> Option<u32> {
        let host_mask = !self.mask;
        let mut host = start & host_mask;
        if host == 0 || host >= host_mask {
            host = 1;
        }

        let mut ip = (self.base & self.mask) | host;
        let mut attempts = 0;
        while self.used.contains(&ip) && attempts < self.host_count() {
            host += 1;
            if host >= host_mask {
                host = 1;
            }
            ip = (self.base & self.mask) | host;
            attempts += 1;
        }
        if self.used.contains(&ip) {
            None
        } else {
            Some(ip)
        }
    }
}
