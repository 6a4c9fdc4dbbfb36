//! Process-global pool of reusable byte buffers.
//!
//! Ring buffers and scratch frame buffers are rented from here instead of
//! allocated per use. Every rent pairs with exactly one return; the return
//! happens automatically when the [`PooledBuf`] guard drops, so early
//! returns and error paths cannot leak a buffer.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::constants::RING_CAPACITY;

/// How many idle buffers the pool retains before freeing excess ones.
const MAX_IDLE_BUFFERS: usize = 64;

/// A pool of reusable `Vec<u8>` buffers.
///
/// Buffers are handed out as [`PooledBuf`] guards sized (and zeroed) to the
/// requested length; dropping the guard returns the allocation to the pool.
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
    /// Buffers currently rented out. Used to assert the rent/return pairing.
    outstanding: AtomicUsize,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BufferPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        })
    }

    /// The process-global pool used by mux ring buffers and frame writers.
    pub fn global() -> &'static Arc<BufferPool> {
        static GLOBAL: OnceLock<Arc<BufferPool>> = OnceLock::new();
        GLOBAL.get_or_init(BufferPool::new)
    }

    /// Rent a zero-filled buffer of exactly `len` bytes.
    ///
    /// Reuses a previously returned allocation when one is available.
    pub fn rent(self: &Arc<Self>, len: usize) -> PooledBuf {
        let mut data = self
            .idle
            .lock()
            .expect("buffer pool mutex poisoned")
            .pop()
            .unwrap_or_default();
        data.clear();
        data.resize(len, 0);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            data: Some(data),
            pool: Arc::clone(self),
        }
    }

    /// Rent a ring-sized buffer ([`RING_CAPACITY`] bytes).
    pub fn rent_ring(self: &Arc<Self>) -> PooledBuf {
        self.rent(RING_CAPACITY)
    }

    /// Number of buffers currently rented out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn give_back(&self, data: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut idle = self.idle.lock().expect("buffer pool mutex poisoned");
        if idle.len() < MAX_IDLE_BUFFERS {
            idle.push(data);
        }
    }
}

/// A rented buffer that returns itself to the pool on drop.
pub struct PooledBuf {
    data: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.data.as_ref().map_or(0, Vec::len))
            .finish_non_exhaustive()
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().expect("pooled buffer already returned")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data
            .as_deref_mut()
            .expect("pooled buffer already returned")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.give_back(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_returns_zeroed_buffer_of_requested_len() {
        let pool = BufferPool::new();
        let buf = pool.rent(128);
        assert_eq!(buf.len(), 128);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_drop_returns_buffer_to_pool() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.rent(16);
            buf[0] = 0xAA;
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);

        // Reuse still yields zeroed contents.
        let buf = pool.rent(16);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_every_rent_pairs_with_one_return() {
        let pool = BufferPool::new();
        let bufs: Vec<_> = (0..10).map(|_| pool.rent(8)).collect();
        assert_eq!(pool.outstanding(), 10);
        drop(bufs);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_ring_rent_is_ring_sized() {
        let pool = BufferPool::new();
        let buf = pool.rent_ring();
        assert_eq!(buf.len(), RING_CAPACITY);
    }
}
