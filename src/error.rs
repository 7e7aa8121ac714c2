//! Error taxonomy for the relay.
//!
//! `StartError` covers fatal configuration/resource failures surfaced once, at
//! startup. `PacketError` covers per-datagram faults that are always recovered
//! locally by the caller (logged and dropped) and never escape a component.

use thiserror::Error;

/// Fatal errors that can occur while bringing a [`crate::relay::Server`] up.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("mtu {0} is below the minimum of 1280")]
    MTUTooSmall(u16),

    #[error("unknown proxy mode {0:?}")]
    UnknownProxyMode(String),

    #[error("invalid preshared key: {0}")]
    InvalidPSK(String),

    #[error("wg endpoint {0:?} did not resolve to any address")]
    EndpointUnresolvable(String),

    #[error("io error binding socket: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-datagram codec failures. Always handled locally; never bubbles past
/// the ingress loop or the wg-side worker that produced it.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("bad packet: {0}")]
    BadPacket(&'static str),

    #[error("encrypt failed: {0}")]
    EncryptFailed(&'static str),
}
