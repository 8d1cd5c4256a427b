//! PartyLAN core: a peer-to-peer overlay VPN for session members.
//!
//! Each participant claims a unique IPv4 address inside a shared virtual
//! subnet through a leaderless probe/announce protocol, then bridges a
//! local TUN interface onto the session's relayed P2P message transport:
//! outbound frames are routed to the owning peer (or fanned out for
//! broadcast), inbound frames are written to the interface or relayed a
//! single hop.
//!
//! The session platform stays external: it supplies a
//! [`transport::SessionTransport`] plus join/leave callbacks, and the
//! frontend drives everything through [`bridge::VpnBridge`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod lease;
pub mod negotiator;
pub mod packet;
pub mod routes;
pub mod stats;
pub mod transport;
pub mod tun;

mod dispatcher;

pub use bridge::{TunFactory, VpnBridge};
pub use config::VpnConfig;
pub use error::VpnError;
pub use routes::RouteEntry;
pub use stats::StatsSnapshot;
pub use transport::SessionTransport;
pub use tun::TunDevice;

pub use partylan_proto::{Frame, FrameType, NodeId, PeerId};
