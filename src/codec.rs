//! Packet Handler (C1): stateless, thread-safe datagram obfuscation.
//!
//! Both variants operate in place on a caller-owned buffer, trading head/tail
//! slack (`front_overhead`/`rear_overhead`) for the ability to avoid a copy.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::config::ProxyMode;
use crate::error::PacketError;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Total front+rear overhead a [`ProxyMode`] would add, without constructing
/// a handler (and so without needing a derived key) — used by `--dry-run` to
/// report derived MTUs without requiring the PSK validation that only
/// matters once packets actually flow.
pub fn overhead_for(mode: ProxyMode) -> usize {
    match mode {
        ProxyMode::ZeroOverhead => 0,
        ProxyMode::Paranoid => NONCE_LEN + TAG_LEN,
    }
}

/// A stateless codec that turns plaintext WireGuard packets into obfuscated
/// datagrams and back. Implementations must be safe to share behind a single
/// `Arc` across every session.
pub trait PacketHandler: Send + Sync {
    /// Bytes of head-room the codec needs before the plaintext on encrypt.
    fn front_overhead(&self) -> usize;

    /// Bytes of tail-room the codec needs after the plaintext on encrypt.
    fn rear_overhead(&self) -> usize;

    /// Decrypt/unwrap `buf[start..start+length]` in place. Returns the
    /// plaintext's bounds, which lie entirely inside the input slice.
    fn decrypt(&self, buf: &mut [u8], start: usize, length: usize) -> Result<(usize, usize), PacketError>;

    /// Encrypt/wrap the plaintext at `buf[plain_start..plain_start+plain_length]`
    /// in place. The caller guarantees `front_overhead()` bytes of room before
    /// `plain_start` and `rear_overhead()` bytes after the plaintext ends.
    fn encrypt(&self, buf: &mut [u8], plain_start: usize, plain_length: usize) -> Result<(usize, usize), PacketError>;
}

/// `zero-overhead` mode: no obfuscation at all, used when the proxy link is
/// already trusted or obfuscation is handled by an outer tunnel.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl PacketHandler for Passthrough {
    fn front_overhead(&self) -> usize {
        0
    }

    fn rear_overhead(&self) -> usize {
        0
    }

    fn decrypt(&self, _buf: &mut [u8], start: usize, length: usize) -> Result<(usize, usize), PacketError> {
        Ok((start, length))
    }

    fn encrypt(&self, _buf: &mut [u8], plain_start: usize, plain_length: usize) -> Result<(usize, usize), PacketError> {
        Ok((plain_start, plain_length))
    }
}

/// `paranoid` mode: XChaCha20-Poly1305 with a random 24-byte nonce prepended
/// to every datagram and a 16-byte tag appended. There is no associated
/// per-session state — the PSK-derived key is the only secret, so a random
/// (rather than counter-based) nonce is required since this single instance
/// is shared across every session's packets concurrently.
pub struct ParanoidAead {
    cipher: XChaCha20Poly1305,
}

impl ParanoidAead {
    /// `key` must be exactly 32 bytes — callers derive it from the raw PSK
    /// via [`crate::config::derive_key`] before construction.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
        }
    }
}

impl PacketHandler for ParanoidAead {
    fn front_overhead(&self) -> usize {
        NONCE_LEN
    }

    fn rear_overhead(&self) -> usize {
        TAG_LEN
    }

    fn decrypt(&self, buf: &mut [u8], start: usize, length: usize) -> Result<(usize, usize), PacketError> {
        if length < NONCE_LEN + TAG_LEN {
            return Err(PacketError::BadPacket("datagram shorter than nonce+tag overhead"));
        }
        let nonce_start = start;
        let body_start = start + NONCE_LEN;
        let body_len = length - NONCE_LEN;

        let nonce = XNonce::clone_from_slice(&buf[nonce_start..body_start]);
        let mut body = buf[body_start..body_start + body_len].to_vec();
        self.cipher
            .decrypt_in_place(&nonce, b"", &mut body)
            .map_err(|_| PacketError::BadPacket("aead authentication failed"))?;

        let plain_len = body.len();
        buf[body_start..body_start + plain_len].copy_from_slice(&body);
        Ok((body_start, plain_len))
    }

    fn encrypt(&self, buf: &mut [u8], plain_start: usize, plain_length: usize) -> Result<(usize, usize), PacketError> {
        if plain_start < NONCE_LEN {
            return Err(PacketError::EncryptFailed("insufficient front overhead"));
        }
        let out_start = plain_start - NONCE_LEN;
        let tail_available = buf.len() - (plain_start + plain_length);
        if tail_available < TAG_LEN {
            return Err(PacketError::EncryptFailed("insufficient rear overhead"));
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::clone_from_slice(&nonce_bytes);

        let mut body = buf[plain_start..plain_start + plain_length].to_vec();
        self.cipher
            .encrypt_in_place(&nonce, b"", &mut body)
            .map_err(|_| PacketError::EncryptFailed("aead encryption failed"))?;

        buf[out_start..out_start + NONCE_LEN].copy_from_slice(&nonce_bytes);
        let out_len = NONCE_LEN + body.len();
        buf[out_start + NONCE_LEN..out_start + out_len].copy_from_slice(&body);
        Ok((out_start, out_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_round_trip() {
        let handler = Passthrough;
        let mut buf = b"hello wireguard".to_vec();
        let (ps, pl) = handler.decrypt(&mut buf, 0, buf.len()).unwrap();
        assert_eq!(&buf[ps..ps + pl], b"hello wireguard");
        let (os, ol) = handler.encrypt(&mut buf, ps, pl).unwrap();
        assert_eq!(&buf[os..os + ol], b"hello wireguard");
    }

    #[test]
    fn paranoid_round_trip() {
        let key = [7u8; 32];
        let handler = ParanoidAead::new(&key);
        let plaintext = b"a wireguard data packet payload";

        let mut buf = vec![0u8; handler.front_overhead() + plaintext.len() + handler.rear_overhead() + 32];
        let plain_start = handler.front_overhead();
        buf[plain_start..plain_start + plaintext.len()].copy_from_slice(plaintext);

        let (out_start, out_len) = handler.encrypt(&mut buf, plain_start, plaintext.len()).unwrap();

        let (dec_start, dec_len) = handler.decrypt(&mut buf, out_start, out_len).unwrap();
        assert_eq!(&buf[dec_start..dec_start + dec_len], &plaintext[..]);
    }

    #[test]
    fn paranoid_rejects_tampered_packet() {
        let key = [3u8; 32];
        let handler = ParanoidAead::new(&key);
        let plaintext = b"handshake-ish payload";

        let mut buf = vec![0u8; handler.front_overhead() + plaintext.len() + handler.rear_overhead()];
        let plain_start = handler.front_overhead();
        buf[plain_start..plain_start + plaintext.len()].copy_from_slice(plaintext);
        let (out_start, out_len) = handler.encrypt(&mut buf, plain_start, plaintext.len()).unwrap();

        buf[out_start + out_len - 1] ^= 0xFF;

        assert!(handler.decrypt(&mut buf, out_start, out_len).is_err());
    }

    #[test]
    fn paranoid_rejects_short_packet() {
        let key = [1u8; 32];
        let handler = ParanoidAead::new(&key);
        let mut buf = vec![0u8; 8];
        assert!(handler.decrypt(&mut buf, 0, 8).is_err());
    }
}
