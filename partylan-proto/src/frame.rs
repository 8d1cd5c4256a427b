//! Overlay frame codec.
//!
//! Layouts (after the 3-byte header):
//! - IP_PACKET:        `[sender:32][ipv4 frame:N]`
//! - ROUTE_UPDATE:     repeated `[peer_id:8][virtual_ip:4]`
//! - PROBE_REQUEST:    `[candidate_ip:4][requester:32]`
//! - PROBE_RESPONSE:   `[conflicting_ip:4][holder:32][last_heartbeat_ms:8]`
//! - ADDRESS_ANNOUNCE: `[virtual_ip:4][announcer:32]`
//! - FORCED_RELEASE:   `[ip_to_release:4][winner:32]`
//! - HEARTBEAT:        `[virtual_ip:4][node:32][timestamp_ms:8]`

use std::io::Cursor;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::node_id::{NodeId, PeerId, NODE_ID_LEN};
use crate::ProtoError;

/// Header size: type byte plus big-endian payload length.
pub const FRAME_HEADER_LEN: usize = 3;

/// Bytes added to an IPv4 frame by IP_PACKET encapsulation.
pub const ENCAP_OVERHEAD: usize = FRAME_HEADER_LEN + NODE_ID_LEN;

/// Largest payload the u16 length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Frame type discriminants.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Encapsulated IPv4 frame, data plane.
    IpPacket = 1,
    /// Full routing-table exchange.
    RouteUpdate = 3,
    /// Address probe during negotiation.
    ProbeRequest = 10,
    /// Conflict response to a probe.
    ProbeResponse = 11,
    /// Claim of a negotiated address.
    AddressAnnounce = 12,
    /// Order to a losing peer to surrender an address.
    ForcedRelease = 13,
    /// Liveness beacon / lease renewal.
    Heartbeat = 14,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::IpPacket),
            3 => Ok(Self::RouteUpdate),
            10 => Ok(Self::ProbeRequest),
            11 => Ok(Self::ProbeResponse),
            12 => Ok(Self::AddressAnnounce),
            13 => Ok(Self::ForcedRelease),
            14 => Ok(Self::Heartbeat),
            other => Err(ProtoError::UnknownFrameType(other)),
        }
    }
}

/// A decoded overlay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    IpPacket {
        sender: NodeId,
        packet: Bytes,
    },
    RouteUpdate {
        routes: Vec<(PeerId, Ipv4Addr)>,
    },
    ProbeRequest {
        candidate: Ipv4Addr,
        requester: NodeId,
    },
    ProbeResponse {
        conflicting: Ipv4Addr,
        holder: NodeId,
        last_heartbeat_ms: i64,
    },
    AddressAnnounce {
        address: Ipv4Addr,
        announcer: NodeId,
    },
    ForcedRelease {
        address: Ipv4Addr,
        winner: NodeId,
    },
    Heartbeat {
        address: Ipv4Addr,
        node: NodeId,
        timestamp_ms: i64,
    },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::IpPacket { .. } => FrameType::IpPacket,
            Frame::RouteUpdate { .. } => FrameType::RouteUpdate,
            Frame::ProbeRequest { .. } => FrameType::ProbeRequest,
            Frame::ProbeResponse { .. } => FrameType::ProbeResponse,
            Frame::AddressAnnounce { .. } => FrameType::AddressAnnounce,
            Frame::ForcedRelease { .. } => FrameType::ForcedRelease,
            Frame::Heartbeat { .. } => FrameType::Heartbeat,
        }
    }

    /// Encode to wire format. Fails with `PayloadTooLarge` when the
    /// payload would not fit the u16 length field; IP_PACKET payloads
    /// are bounded by the negotiated MTU, far below that, but a huge
    /// routing table can overflow a single ROUTE_UPDATE.
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let mut payload = BytesMut::with_capacity(64);

        match self {
            Frame::IpPacket { sender, packet } => {
                payload.put_slice(sender.as_bytes());
                payload.put_slice(packet);
            }
            Frame::RouteUpdate { routes } => {
                for (peer, ip) in routes {
                    payload.put_u64(*peer);
                    payload.put_u32(u32::from(*ip));
                }
            }
            Frame::ProbeRequest {
                candidate,
                requester,
            } => {
                payload.put_u32(u32::from(*candidate));
                payload.put_slice(requester.as_bytes());
            }
            Frame::ProbeResponse {
                conflicting,
                holder,
                last_heartbeat_ms,
            } => {
                payload.put_u32(u32::from(*conflicting));
                payload.put_slice(holder.as_bytes());
                payload.put_i64(*last_heartbeat_ms);
            }
            Frame::AddressAnnounce { address, announcer } => {
                payload.put_u32(u32::from(*address));
                payload.put_slice(announcer.as_bytes());
            }
            Frame::ForcedRelease { address, winner } => {
                payload.put_u32(u32::from(*address));
                payload.put_slice(winner.as_bytes());
            }
            Frame::Heartbeat {
                address,
                node,
                timestamp_ms,
            } => {
                payload.put_u32(u32::from(*address));
                payload.put_slice(node.as_bytes());
                payload.put_i64(*timestamp_ms);
            }
        }

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtoError::PayloadTooLarge);
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u8(self.frame_type() as u8);
        buf.put_u16(payload.len() as u16);
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode one frame from `data`.
    ///
    /// Rejects frames whose declared length exceeds the buffer; trailing
    /// bytes past the declared length are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        if data.is_empty() {
            return Err(ProtoError::EmptyFrame);
        }
        if data.len() < FRAME_HEADER_LEN {
            return Err(ProtoError::Truncated);
        }

        let frame_type = FrameType::try_from(data[0])?;
        let length = u16::from_be_bytes([data[1], data[2]]) as usize;
        if data.len() - FRAME_HEADER_LEN < length {
            return Err(ProtoError::LengthOverrun);
        }

        let payload = &data[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length];
        let mut cursor = Cursor::new(payload);

        match frame_type {
            FrameType::IpPacket => {
                let sender = get_node_id(&mut cursor)?;
                let packet = Bytes::copy_from_slice(&payload[NODE_ID_LEN..]);
                Ok(Frame::IpPacket { sender, packet })
            }
            FrameType::RouteUpdate => {
                let mut routes = Vec::with_capacity(payload.len() / 12);
                while cursor.remaining() >= 12 {
                    let peer = cursor.get_u64();
                    let ip = Ipv4Addr::from(cursor.get_u32());
                    routes.push((peer, ip));
                }
                Ok(Frame::RouteUpdate { routes })
            }
            FrameType::ProbeRequest => {
                let candidate = get_ipv4(&mut cursor)?;
                let requester = get_node_id(&mut cursor)?;
                Ok(Frame::ProbeRequest {
                    candidate,
                    requester,
                })
            }
            FrameType::ProbeResponse => {
                let conflicting = get_ipv4(&mut cursor)?;
                let holder = get_node_id(&mut cursor)?;
                let last_heartbeat_ms = get_i64(&mut cursor)?;
                Ok(Frame::ProbeResponse {
                    conflicting,
                    holder,
                    last_heartbeat_ms,
                })
            }
            FrameType::AddressAnnounce => {
                let address = get_ipv4(&mut cursor)?;
                let announcer = get_node_id(&mut cursor)?;
                Ok(Frame::AddressAnnounce { address, announcer })
            }
            FrameType::ForcedRelease => {
                let address = get_ipv4(&mut cursor)?;
                let winner = get_node_id(&mut cursor)?;
                Ok(Frame::ForcedRelease { address, winner })
            }
            FrameType::Heartbeat => {
                let address = get_ipv4(&mut cursor)?;
                let node = get_node_id(&mut cursor)?;
                let timestamp_ms = get_i64(&mut cursor)?;
                Ok(Frame::Heartbeat {
                    address,
                    node,
                    timestamp_ms,
                })
            }
        }
    }
}

fn get_ipv4(cursor: &mut Cursor<&[u8]>) -> Result<Ipv4Addr, ProtoError> {
    if cursor.remaining() < 4 {
        return Err(ProtoError::Truncated);
    }
    Ok(Ipv4Addr::from(cursor.get_u32()))
}

fn get_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64, ProtoError> {
    if cursor.remaining() < 8 {
        return Err(ProtoError::Truncated);
    }
    Ok(cursor.get_i64())
}

fn get_node_id(cursor: &mut Cursor<&[u8]>) -> Result<NodeId, ProtoError> {
    if cursor.remaining() < NODE_ID_LEN {
        return Err(ProtoError::Truncated);
    }
    let mut bytes = [0u8; NODE_ID_LEN];
    cursor.copy_to_slice(&mut bytes);
    Ok(NodeId::from_bytes(bytes))
}
