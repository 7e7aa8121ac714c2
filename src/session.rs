//! Session Table (C3) and the per-client state each session shares between
//! the ingress loop and its two worker tasks (C6, C7).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::pktinfo::PktInfo;

/// A plaintext WireGuard packet, already decoded from its proxy-side framing,
/// queued for the Proxy→Wg worker to forward and release back to the pool.
pub struct QueuedPacket {
    pub buf: Vec<u8>,
    pub start: usize,
    pub len: usize,
}

/// Everything a session's two workers and the ingress loop share.
pub struct SessionEntry {
    pub client_addr: SocketAddr,

    /// `max_proxy_packet_size` for this client's address family, used to size
    /// outgoing (Wg→Proxy) buffers.
    pub max_proxy_packet_size: usize,

    /// Proxy→Wg hand-off queue. Bounded: a slow wg endpoint sheds the newest
    /// packet rather than growing without limit.
    pub to_wg: mpsc::Sender<QueuedPacket>,

    /// The most recent pktinfo seen from this client, published by the
    /// ingress loop and read by the Wg→Proxy worker so replies leave from the
    /// same local address the client is talking to.
    pub pktinfo: ArcSwap<Option<PktInfo>>,

    /// Upstream idle deadline, refreshed by the ingress loop on a handshake
    /// initiation/response and consumed by both workers via
    /// `tokio::time::timeout_at`.
    pub deadline: watch::Sender<Instant>,
}

impl SessionEntry {
    pub fn refresh_deadline(&self, at: Instant) {
        self.deadline.send_replace(at);
    }

    pub fn publish_pktinfo(&self, info: Option<PktInfo>) {
        let changed = match (self.pktinfo.load().as_ref(), &info) {
            (None, None) => false,
            (Some(a), Some(b)) => a != b,
            _ => true,
        };
        if changed {
            self.pktinfo.store(Arc::new(info));
        }
    }
}

/// The live client-address → session map (C3). Guarded by a plain
/// `parking_lot::Mutex` — lookups and inserts are O(1) pointer work, never
/// held across an `.await`.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<SocketAddr, Arc<SessionEntry>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Arc<SessionEntry>> {
        self.sessions.lock().get(&addr).cloned()
    }

    pub fn insert(&self, addr: SocketAddr, entry: Arc<SessionEntry>) {
        self.sessions.lock().insert(addr, entry);
    }

    pub fn remove(&self, addr: SocketAddr) -> Option<Arc<SessionEntry>> {
        self.sessions.lock().remove(&addr)
    }

    /// Injects an immediate read-deadline into every live session under one
    /// critical section, per the Stop sequence: this is the sole signal that
    /// tells every Wg→Proxy worker to unwind.
    pub fn refresh_all_deadlines(&self, at: Instant) {
        for entry in self.sessions.lock().values() {
            entry.refresh_deadline(at);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Snapshot of every live client address, used by `Stop` to join every
    /// session's workers.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.sessions.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: SocketAddr) -> Arc<SessionEntry> {
        let (to_wg, _rx) = mpsc::channel(8);
        let (deadline, _dr) = watch::channel(Instant::now());
        Arc::new(SessionEntry {
            client_addr: addr,
            max_proxy_packet_size: 1400,
            to_wg,
            pktinfo: ArcSwap::from_pointee(None),
            deadline,
        })
    }

    #[test]
    fn insert_get_remove_round_trips() {
        let table = SessionTable::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(table.get(addr).is_none());

        table.insert(addr, entry(addr));
        assert!(table.get(addr).is_some());
        assert_eq!(table.len(), 1);

        let removed = table.remove(addr);
        assert!(removed.is_some());
        assert!(table.get(addr).is_none());
    }

    #[test]
    fn publish_pktinfo_skips_redundant_stores() {
        let addr: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let e = entry(addr);
        e.publish_pktinfo(None);
        let before = e.pktinfo.load_full();
        e.publish_pktinfo(None);
        assert!(Arc::ptr_eq(&before, &e.pktinfo.load_full()));
    }

    #[test]
    fn addrs_snapshot_reflects_current_sessions() {
        let table = SessionTable::new();
        let a: SocketAddr = "127.0.0.1:10".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:11".parse().unwrap();
        table.insert(a, entry(a));
        table.insert(b, entry(b));
        let mut addrs = table.addrs();
        addrs.sort();
        assert_eq!(addrs, vec![a, b]);
    }
}
