//! VPN configuration.
//!
//! Plain values handed to the bridge at construction; there is no file
//! format here. The session frontend owns persistence and fills this in.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Tunables for the overlay VPN.
#[derive(Debug, Clone)]
pub struct VpnConfig {
    /// Base address of the shared overlay subnet (e.g. `10.0.0.0`).
    pub virtual_subnet: Ipv4Addr,
    /// Subnet mask of the overlay.
    pub subnet_mask: Ipv4Addr,
    /// Upper bound on the negotiated TUN MTU.
    pub default_mtu: u16,
    /// Preferred virtual NIC name hint.
    pub tun_device_name: String,
    /// Salt mixed into node-id derivation.
    pub app_secret_salt: String,
    /// Probe window length during address negotiation.
    pub probe_timeout: Duration,
    /// Beacon period for liveness.
    pub heartbeat_interval: Duration,
    /// Silence after which a conflict responder is treated as stale.
    /// Deliberately shorter than `lease_expiry` so a moderately silent
    /// holder can be displaced without waiting out the full lease.
    pub heartbeat_expiry: Duration,
    /// Silence after which a peer's lease is evicted.
    pub lease_expiry: Duration,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            virtual_subnet: Ipv4Addr::new(10, 0, 0, 0),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            default_mtu: 1500,
            tun_device_name: "party0".to_string(),
            app_secret_salt: "partylan-salt-v1".to_string(),
            probe_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_expiry: Duration::from_secs(180),
            lease_expiry: Duration::from_secs(360),
        }
    }
}
