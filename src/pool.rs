//! Buffer Pool (C2): reusable fixed-size packet buffers.
//!
//! Buffers flow ingress → send queue → Proxy→Wg worker → pool, one owner at a
//! time. A handle that's simply dropped without calling [`BufferPool::release`]
//! just frees its `Vec` normally — the pool notices on its next empty-acquire
//! and allocates a replacement. No unsafe tricks, no double-free surface.

use parking_lot::Mutex;

/// Idle buffers beyond this count are dropped instead of recycled, so a
/// traffic spike doesn't pin memory once it subsides.
const MAX_IDLE_BUFFERS: usize = 4096;

pub struct BufferPool {
    buf_len: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// `buf_len` should be `max_proxy_packet_size_v4`, the larger of the two
    /// address-family sizes, so any ingress datagram fits regardless of the
    /// client's family.
    pub fn new(buf_len: usize) -> Self {
        Self {
            buf_len,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    /// Acquire an exclusive buffer, zero-length contents undefined (callers
    /// overwrite before reading back what they wrote).
    pub fn acquire(&self) -> Vec<u8> {
        if let Some(mut buf) = self.free.lock().pop() {
            buf.resize(self.buf_len, 0);
            return buf;
        }
        vec![0u8; self.buf_len]
    }

    /// Return a buffer for reuse. Buffers of the wrong length (shouldn't
    /// happen in steady state) are dropped rather than recycled.
    pub fn release(&self, buf: Vec<u8>) {
        if buf.capacity() < self.buf_len {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < MAX_IDLE_BUFFERS {
            free.push(buf);
        }
    }

    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.free.lock().len()
    }
}
