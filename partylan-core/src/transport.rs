//! Session transport contract.
//!
//! The relayed, NAT-traversing P2P messaging layer is owned by the
//! session platform; the core consumes it through this trait. Reliable
//! sends map to the transport's ordered class (control frames);
//! unreliable maps to its lowest-latency class (IP_PACKET).

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use partylan_proto::PeerId;

#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// The local participant's platform identity.
    fn local_peer_id(&self) -> PeerId;

    /// Human-readable name for a session member.
    fn display_name(&self, peer: PeerId) -> String;

    /// Current session members, excluding the local peer.
    fn members(&self) -> Vec<PeerId>;

    /// Largest message the transport carries without fragmenting.
    fn max_unfragmented_payload(&self) -> usize;

    /// Send one message to one member.
    async fn send(&self, peer: PeerId, bytes: Bytes, reliable: bool) -> io::Result<()>;

    /// Send one message to every current member.
    async fn broadcast(&self, bytes: Bytes, reliable: bool) {
        for peer in self.members() {
            let _ = self.send(peer, bytes.clone(), reliable).await;
        }
    }

    /// Drain up to `max` pending inbound messages. Never blocks: returns
    /// an empty batch when the queue is dry.
    async fn recv_batch(&self, max: usize) -> Vec<(PeerId, Bytes)>;
}
