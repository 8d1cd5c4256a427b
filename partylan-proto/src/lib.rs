//! PartyLAN Wire Protocol
//!
//! Binary protocol for the overlay VPN:
//! - IP_PACKET: encapsulated IPv4 frame with the sender's node id
//! - PROBE_REQUEST / PROBE_RESPONSE / ADDRESS_ANNOUNCE / FORCED_RELEASE:
//!   distributed address negotiation
//! - HEARTBEAT: liveness / lease renewal
//! - ROUTE_UPDATE: full routing-table exchange
//!
//! Every frame is a 3-byte header (`type: u8`, `length: u16` big-endian)
//! followed by `length` payload bytes. Multi-byte integers are big-endian;
//! node ids are raw byte arrays; the embedded IPv4 packet keeps its own
//! network byte order.

pub mod frame;
pub mod node_id;

pub use frame::{Frame, FrameType, ENCAP_OVERHEAD, FRAME_HEADER_LEN, MAX_PAYLOAD_LEN};
pub use node_id::{NodeId, PeerId, NODE_ID_LEN};

/// Errors produced while decoding an overlay frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),
    #[error("frame truncated")]
    Truncated,
    #[error("declared payload length exceeds buffer")]
    LengthOverrun,
    #[error("payload too large for a single frame")]
    PayloadTooLarge,
}
