//! Configuration (C9): JSON on-disk schema, validation, and the PSK key
//! derivation shared with [`crate::codec`].

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::StartError;

const MIN_MTU: u16 = 1280;

fn default_mtu() -> u16 {
    1420
}

fn default_relay_batch_size() -> usize {
    32
}

fn default_main_recv_batch_size() -> usize {
    32
}

fn default_send_channel_capacity() -> usize {
    1024
}

/// The obfuscation mode a server entry runs its [`crate::codec::PacketHandler`] in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    ZeroOverhead,
    Paranoid,
}

impl ProxyMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "zero-overhead" => Some(Self::ZeroOverhead),
            "paranoid" => Some(Self::Paranoid),
            _ => None,
        }
    }
}

/// One `[[servers]]` entry: a single proxy-listener-to-wg-endpoint relay.
///
/// `proxy_mode` is kept as the raw on-disk string rather than parsed at
/// deserialize time so that an unrecognized mode surfaces as
/// [`StartError::UnknownProxyMode`] at `validate()`, alongside every other
/// fatal-at-Start config problem, instead of as an opaque JSON parse error.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub proxy_listen: SocketAddr,
    pub proxy_mode: String,
    #[serde(default)]
    pub proxy_psk: Option<String>,
    #[serde(default)]
    pub proxy_fwmark: u32,
    pub wg_endpoint: String,
    #[serde(default)]
    pub wg_fwmark: u32,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_relay_batch_size")]
    pub relay_batch_size: usize,
    #[serde(default = "default_main_recv_batch_size")]
    pub main_recv_batch_size: usize,
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
    #[serde(default)]
    pub batch_mode: bool,
}

/// The top-level config file: a list of independent server entries.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&text)?;
        Ok(config)
    }
}

impl ServerConfig {
    /// Validates this entry's statically-checkable fields, returning the
    /// resolved [`ProxyMode`] and the derived AEAD key when that mode is
    /// [`ProxyMode::Paranoid`].
    pub fn validate(&self) -> Result<(ProxyMode, Option<[u8; 32]>), StartError> {
        if self.mtu < MIN_MTU {
            return Err(StartError::MTUTooSmall(self.mtu));
        }

        let mode = ProxyMode::parse(&self.proxy_mode).ok_or_else(|| StartError::UnknownProxyMode(self.proxy_mode.clone()))?;

        match mode {
            ProxyMode::ZeroOverhead => Ok((mode, None)),
            ProxyMode::Paranoid => {
                let psk = self.proxy_psk.as_deref().ok_or_else(|| StartError::InvalidPSK("paranoid mode requires proxy_psk".to_string()))?;
                if psk.is_empty() {
                    return Err(StartError::InvalidPSK("proxy_psk must not be empty".to_string()));
                }
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(psk)
                    .map_err(|e| StartError::InvalidPSK(e.to_string()))?;
                if raw.is_empty() {
                    return Err(StartError::InvalidPSK("proxy_psk decodes to no bytes".to_string()));
                }
                Ok((mode, Some(derive_key(&raw))))
            }
        }
    }

    /// Resolves `wg_endpoint` (a `host:port` string) to its first address.
    /// Resolution happens at Start, not at load time, so config loading never
    /// touches the network.
    pub fn resolve_wg_endpoint(&self) -> Result<SocketAddr, StartError> {
        use std::net::ToSocketAddrs;
        self.wg_endpoint
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| StartError::EndpointUnresolvable(self.wg_endpoint.clone()))
    }
}

/// Derives a 32-byte AEAD key from the raw (already base64-decoded) PSK
/// bytes via SHA-256. Any length of input is accepted; the PSK itself, not
/// this derivation step, is the thing operators must keep secret.
pub fn derive_key(raw_psk: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(raw_psk);
    hasher.finalize().into()
}

use base64::Engine as _;

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            name: "test".to_string(),
            proxy_listen: "0.0.0.0:51820".parse().unwrap(),
            proxy_mode: "zero-overhead".to_string(),
            proxy_psk: None,
            proxy_fwmark: 0,
            wg_endpoint: "127.0.0.1:51821".to_string(),
            wg_fwmark: 0,
            mtu: 1420,
            relay_batch_size: 32,
            main_recv_batch_size: 32,
            send_channel_capacity: 1024,
            batch_mode: false,
        }
    }

    #[test]
    fn rejects_mtu_below_minimum() {
        let mut cfg = base_config();
        cfg.mtu = 576;
        assert!(matches!(cfg.validate(), Err(StartError::MTUTooSmall(576))));
    }

    #[test]
    fn mtu_below_minimum_is_checked_before_proxy_mode() {
        let mut cfg = base_config();
        cfg.mtu = 1279;
        cfg.proxy_mode = "nonsense".to_string();
        assert!(matches!(cfg.validate(), Err(StartError::MTUTooSmall(1279))));
    }

    #[test]
    fn zero_overhead_mode_needs_no_psk() {
        let cfg = base_config();
        let (mode, key) = cfg.validate().unwrap();
        assert_eq!(mode, ProxyMode::ZeroOverhead);
        assert_eq!(key, None);
    }

    #[test]
    fn unknown_proxy_mode_is_rejected() {
        let mut cfg = base_config();
        cfg.proxy_mode = "turbo-encabulator".to_string();
        assert!(matches!(cfg.validate(), Err(StartError::UnknownProxyMode(_))));
    }

    #[test]
    fn paranoid_mode_without_psk_is_rejected() {
        let mut cfg = base_config();
        cfg.proxy_mode = "paranoid".to_string();
        assert!(matches!(cfg.validate(), Err(StartError::InvalidPSK(_))));
    }

    #[test]
    fn paranoid_mode_with_valid_psk_derives_a_key() {
        let mut cfg = base_config();
        cfg.proxy_mode = "paranoid".to_string();
        cfg.proxy_psk = Some(base64::engine::general_purpose::STANDARD.encode(b"super secret preshared key"));
        let (mode, key) = cfg.validate().unwrap();
        assert_eq!(mode, ProxyMode::Paranoid);
        assert!(key.is_some());
        assert_eq!(key.unwrap().len(), 32);
    }

    #[test]
    fn paranoid_mode_with_invalid_base64_is_rejected() {
        let mut cfg = base_config();
        cfg.proxy_mode = "paranoid".to_string();
        cfg.proxy_psk = Some("not valid base64!!".to_string());
        assert!(matches!(cfg.validate(), Err(StartError::InvalidPSK(_))));
    }

    #[test]
    fn paranoid_mode_with_empty_psk_string_is_rejected() {
        let mut cfg = base_config();
        cfg.proxy_mode = "paranoid".to_string();
        cfg.proxy_psk = Some(String::new());
        assert!(matches!(cfg.validate(), Err(StartError::InvalidPSK(_))));
    }

    #[test]
    fn paranoid_mode_with_psk_decoding_to_no_bytes_is_rejected() {
        let mut cfg = base_config();
        cfg.proxy_mode = "paranoid".to_string();
        // Valid base64 for zero bytes, distinct from an empty on-disk string.
        cfg.proxy_psk = Some(base64::engine::general_purpose::STANDARD.encode(b""));
        assert!(matches!(cfg.validate(), Err(StartError::InvalidPSK(_))));
    }

    #[test]
    fn wg_endpoint_resolves_loopback() {
        let cfg = base_config();
        let addr = cfg.resolve_wg_endpoint().unwrap();
        assert_eq!(addr.port(), 51821);
    }

    #[test]
    fn wg_endpoint_unresolvable_host_is_rejected() {
        let mut cfg = base_config();
        cfg.wg_endpoint = "this-host-does-not-resolve.invalid:51821".to_string();
        assert!(matches!(cfg.resolve_wg_endpoint(), Err(StartError::EndpointUnresolvable(_))));
    }

    #[test]
    fn derive_key_is_deterministic() {
        let a = derive_key(b"same psk bytes");
        let b = derive_key(b"same psk bytes");
        assert_eq!(a, b);
    }

    #[test]
    fn config_loads_from_json() {
        let json = r#"{
            "servers": [{
                "name": "wg0",
                "proxy_listen": "0.0.0.0:51820",
                "proxy_mode": "paranoid",
                "proxy_psk": "c2VjcmV0LXBzay1ieXRlcw==",
                "wg_endpoint": "127.0.0.1:51821"
            }]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].mtu, default_mtu());
        assert_eq!(config.servers[0].proxy_mode, "paranoid");
        assert_eq!(config.servers[0].validate().unwrap().0, ProxyMode::Paranoid);
    }
}
