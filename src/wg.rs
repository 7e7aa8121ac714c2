//! WireGuard wire-format constants the relay needs to be aware of without
//! ever touching a WireGuard payload's contents.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// First byte of a handshake initiation message.
pub const MSG_HANDSHAKE_INITIATION: u8 = 1;
/// First byte of a handshake response message.
pub const MSG_HANDSHAKE_RESPONSE: u8 = 2;
/// First byte of a cookie reply message.
pub const MSG_COOKIE_REPLY: u8 = 3;
/// First byte of a transport data message.
pub const MSG_DATA: u8 = 4;

/// WireGuard's `RejectAfterTime`: the idle horizon used here as the upstream
/// socket's read-deadline.
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Overhead WireGuard itself adds to a data packet: 16-byte header + 16-byte
/// Poly1305 tag, before 16-byte padding of the plaintext.
pub const WG_DATA_OVERHEAD: usize = 32;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;

/// Does `first_byte` mark a handshake initiation or response? Cookie replies
/// (message type 3) deliberately do **not** refresh the deadline — see
/// DESIGN.md's Open Question decisions.
pub fn is_handshake_refresh_byte(first_byte: u8) -> bool {
    first_byte == MSG_HANDSHAKE_INITIATION || first_byte == MSG_HANDSHAKE_RESPONSE
}

/// Maximum proxy-side packet size for a given MTU and IP address family:
/// `mtu - ip_header - udp_header`.
pub fn max_proxy_packet_size(mtu: u16, family_v6: bool) -> usize {
    let ip_header = if family_v6 { IPV6_HEADER_LEN } else { IPV4_HEADER_LEN };
    mtu as usize - ip_header - UDP_HEADER_LEN
}

/// The effective WireGuard tunnel MTU advertised in logs:
/// `(max_proxy_packet_size - codec_overhead - WG_DATA_OVERHEAD) & ~0xF`.
pub fn tunnel_mtu(max_proxy_packet_size: usize, codec_overhead: usize) -> usize {
    let usable = max_proxy_packet_size.saturating_sub(codec_overhead).saturating_sub(WG_DATA_OVERHEAD);
    usable & !0xF
}

/// Normalizes an address for family-aware comparisons/sizing: an
/// IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) is treated as IPv4.
pub fn normalize(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => {
            if let Some(v4) = v6.ip().to_ipv4_mapped() {
                SocketAddr::new(IpAddr::V4(v4), v6.port())
            } else {
                addr
            }
        }
        SocketAddr::V4(_) => addr,
    }
}

/// Is `addr` (after IPv4-mapped normalization) an IPv6 address?
pub fn is_v6(addr: SocketAddr) -> bool {
    matches!(normalize(addr), SocketAddr::V6(_))
}

/// Address-family-aware equality: `::ffff:1.2.3.4:9` equals `1.2.3.4:9`.
pub fn endpoint_eq(a: SocketAddr, b: SocketAddr) -> bool {
    normalize(a) == normalize(b)
}
