//! Error taxonomy for the bridge control surface.
//!
//! Only `start` surfaces errors to the caller. Steady-state data-plane
//! failures (send errors, malformed frames, TUN I/O hiccups) follow the
//! drop-with-counter policy and never propagate. Address-negotiation
//! exhaustion happens after `start` has returned; it tears the bridge
//! down and shows up as `is_running() == false` plus an error log.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("vpn bridge is already running")]
    AlreadyRunning,

    #[error("invalid virtual subnet configuration")]
    InvalidSubnet,

    #[error("tun device error: {0}")]
    Tun(#[from] io::Error),
}
