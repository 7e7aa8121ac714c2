//! Obfuscating UDP relay core for WireGuard traffic.
//!
//! See [`relay::Server`] for the entry point: binds the proxy-side socket,
//! demultiplexes datagrams into per-client [`session::SessionEntry`]s, and
//! runs the Proxy→Wg / Wg→Proxy worker pair for each one.

pub mod codec;
pub mod config;
pub mod error;
pub mod pktinfo;
pub mod pool;
pub mod relay;
pub mod session;
pub mod wg;
