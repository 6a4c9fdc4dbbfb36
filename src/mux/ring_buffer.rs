//! Per-session output staging buffer inside a mux client.
//!
//! A fixed-capacity byte array (rented from the shared pool) plus a write
//! position, a dropped-byte counter and flush bookkeeping. When a write
//! would overflow, the OLDEST bytes are discarded — never the newest — and
//! `dropped_bytes` records the exact number discarded so the browser can
//! be told precisely how much it missed. The buffer is reset only after a
//! successful send; a failed send leaves the bytes staged for the next
//! attempt.

// Rust guideline compliant 2026-01

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pool::{BufferPool, PooledBuf};

/// Fixed-capacity staging buffer for one session's pending output.
pub struct SessionRingBuffer {
    buf: PooledBuf,
    position: usize,
    dropped_bytes: u64,
    cols: u16,
    rows: u16,
    last_flush: Instant,
}

impl std::fmt::Debug for SessionRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRingBuffer")
            .field("position", &self.position)
            .field("dropped_bytes", &self.dropped_bytes)
            .finish_non_exhaustive()
    }
}

impl SessionRingBuffer {
    /// Rent a ring-sized backing array from `pool`.
    #[must_use]
    pub fn new(pool: &Arc<BufferPool>) -> Self {
        Self {
            buf: pool.rent_ring(),
            position: 0,
            dropped_bytes: 0,
            cols: 0,
            rows: 0,
            last_flush: Instant::now(),
        }
    }

    /// Buffer capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of staged bytes.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.position
    }

    /// Bytes dropped since the last successful flush.
    #[must_use]
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// The staged bytes, oldest first.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.buf[..self.position]
    }

    /// Most recent dimensions reported for this session.
    #[must_use]
    pub fn dims(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    /// Record the dimensions the next flush should carry.
    pub fn set_dims(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    /// Time since the last successful flush.
    #[must_use]
    pub fn since_last_flush(&self) -> Duration {
        self.last_flush.elapsed()
    }

    /// Append `data`, discarding the oldest staged bytes on overflow.
    ///
    /// A single write larger than the whole buffer keeps only its final
    /// `capacity` bytes; everything older (staged bytes plus the write's
    /// own prefix) counts as dropped.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.position == 0 {
            // The background flush clock runs from the first byte of a
            // batch, not from whenever the ring last happened to be empty.
            self.last_flush = Instant::now();
        }
        let capacity = self.capacity();

        if data.len() >= capacity {
            // The write alone fills the buffer: everything currently staged
            // and the excess prefix of the write are dropped.
            self.dropped_bytes += (self.position + data.len() - capacity) as u64;
            let start = data.len() - capacity;
            self.buf.copy_from_slice(&data[start..]);
            self.position = capacity;
            return;
        }

        let needed = self.position + data.len();
        if needed > capacity {
            // Shift out the oldest `overflow` bytes, keep the newest.
            let overflow = needed - capacity;
            self.buf.copy_within(overflow..self.position, 0);
            self.position -= overflow;
            self.dropped_bytes += overflow as u64;
        }

        self.buf[self.position..self.position + data.len()].copy_from_slice(data);
        self.position += data.len();
    }

    /// Reset after a successful send: position and dropped count go to
    /// zero and the flush clock restarts. NOT called on send failure.
    pub fn mark_flushed(&mut self) {
        self.position = 0;
        self.dropped_bytes = 0;
        self.last_flush = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RING_CAPACITY;

    fn ring() -> SessionRingBuffer {
        SessionRingBuffer::new(&BufferPool::new())
    }

    #[test]
    fn test_new_ring_is_empty() {
        let rb = ring();
        assert_eq!(rb.capacity(), RING_CAPACITY);
        assert_eq!(rb.pending(), 0);
        assert_eq!(rb.dropped_bytes(), 0);
        assert!(rb.contents().is_empty());
    }

    #[test]
    fn test_appends_within_capacity_concatenate() {
        // Total ≤ capacity: contents equal the concatenation, dropped 0.
        let mut rb = ring();
        rb.write(b"hello ");
        rb.write(b"world");
        assert_eq!(rb.contents(), b"hello world");
        assert_eq!(rb.dropped_bytes(), 0);
    }

    #[test]
    fn test_overflow_keeps_newest_and_counts_exactly() {
        // Total L > capacity: contents are the last `capacity` bytes,
        // dropped == L − capacity.
        let mut rb = ring();
        let chunk = vec![0x41u8; 100 * 1024];
        let mut total = 0usize;
        let mut all = Vec::new();
        for i in 0..4u8 {
            let mut c = chunk.clone();
            c[0] = i; // make chunks distinguishable
            rb.write(&c);
            all.extend_from_slice(&c);
            total += c.len();
        }
        assert_eq!(rb.pending(), RING_CAPACITY);
        assert_eq!(rb.dropped_bytes(), (total - RING_CAPACITY) as u64);
        assert_eq!(rb.contents(), &all[total - RING_CAPACITY..]);
    }

    #[test]
    fn test_single_oversized_write_keeps_tail() {
        // A 300 KiB write into a 256 KiB ring drops exactly 44 KiB and
        // stages 256 KiB of the tail.
        let mut rb = ring();
        let data = vec![0x41u8; 300 * 1024];
        rb.write(&data);
        assert_eq!(rb.pending(), RING_CAPACITY);
        assert_eq!(rb.dropped_bytes(), (300 * 1024 - RING_CAPACITY) as u64);
        assert_eq!(rb.dropped_bytes(), 44 * 1024);
        assert!(rb.contents().iter().all(|&b| b == 0x41));
    }

    #[test]
    fn test_oversized_write_also_drops_staged_bytes() {
        let mut rb = ring();
        rb.write(b"staged");
        let data = vec![0x42u8; RING_CAPACITY + 10];
        rb.write(&data);
        assert_eq!(rb.pending(), RING_CAPACITY);
        assert_eq!(rb.dropped_bytes(), 6 + 10);
    }

    #[test]
    fn test_exact_capacity_write_drops_nothing() {
        let mut rb = ring();
        rb.write(&vec![0x43u8; RING_CAPACITY]);
        assert_eq!(rb.pending(), RING_CAPACITY);
        assert_eq!(rb.dropped_bytes(), 0);
    }

    #[test]
    fn test_mark_flushed_resets() {
        // After a flush, position == 0 and dropped == 0.
        let mut rb = ring();
        rb.write(&vec![0u8; RING_CAPACITY + 5]);
        assert!(rb.dropped_bytes() > 0);
        rb.mark_flushed();
        assert_eq!(rb.pending(), 0);
        assert_eq!(rb.dropped_bytes(), 0);
        assert!(rb.since_last_flush() < Duration::from_millis(100));
    }

    #[test]
    fn test_failed_send_leaves_state_unchanged() {
        // A send failure simply never calls mark_flushed.
        let mut rb = ring();
        rb.write(b"keep me");
        let pending = rb.pending();
        let dropped = rb.dropped_bytes();
        // ... send fails here ...
        assert_eq!(rb.pending(), pending);
        assert_eq!(rb.dropped_bytes(), dropped);
        assert_eq!(rb.contents(), b"keep me");
    }

    #[test]
    fn test_dims_tracking() {
        let mut rb = ring();
        assert_eq!(rb.dims(), (0, 0));
        rb.set_dims(120, 40);
        assert_eq!(rb.dims(), (120, 40));
    }

    #[test]
    fn test_backing_array_returns_to_pool_on_drop() {
        let pool = BufferPool::new();
        {
            let _rb = SessionRingBuffer::new(&pool);
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
