//! Datagram buffer pooling.
//!
//! Egress buffers cycle through acquire/write/release on every flusher
//! iteration; pooling keeps that loop allocation-free. The pool is shared
//! across sessions and must be thread-safe. Every acquired buffer has
//! exactly one release, enforced by the flusher on all of its exit paths.

use std::sync::Mutex;

/// Smallest datagram buffer the flusher will drain ciphertext into; QUIC
/// requires client Initials padded to at least this size (RFC 9000
/// Section 14.1), and engines refuse smaller buffers.
pub const MIN_DATAGRAM_LEN: usize = 1200;

/// A pooled egress buffer with a fill cursor.
#[derive(Debug)]
pub struct PoolBuffer {
    data: Vec<u8>,
    filled: usize,
}

impl PoolBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The writable backing slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The filled prefix, what actually goes on the wire.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn set_filled(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.filled = len;
    }
}

/// Shared buffer pool.
pub trait BufferPool: Send + Sync {
    /// Get a buffer with at least `min_capacity` bytes.
    fn acquire(&self, min_capacity: usize) -> PoolBuffer;

    /// Return a buffer for reuse.
    fn release(&self, buffer: PoolBuffer);
}

/// Freelist-backed pool, suitable for standalone use and tests.
#[derive(Debug, Default)]
pub struct FreelistPool {
    free: Mutex<Vec<PoolBuffer>>,
}

impl FreelistPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferPool for FreelistPool {
    fn acquire(&self, min_capacity: usize) -> PoolBuffer {
        let mut free = self.free.lock().unwrap();
        if let Some(pos) = free.iter().position(|b| b.capacity() >= min_capacity) {
            let mut buffer = free.swap_remove(pos);
            buffer.set_filled(0);
            return buffer;
        }
        drop(free);
        PoolBuffer::with_capacity(min_capacity)
    }

    fn release(&self, buffer: PoolBuffer) {
        self.free.lock().unwrap().push(buffer);
    }
}
