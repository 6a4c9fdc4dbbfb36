//! Per-browser-connection output pipeline.
//!
//! One [`MuxClient`] per browser WebSocket. Output items arrive on a
//! bounded inbound queue (DropOldest), are staged into per-session ring
//! buffers, and are flushed by a dedicated process-loop task:
//!
//! - the ACTIVE session (the one the user is looking at) flushes on every
//!   loop iteration;
//! - every BACKGROUND session flushes when its staged size reaches the
//!   compression threshold or 2 s after a batch started accumulating.
//!
//! The loop wakes on new data or a 1-second timer, whichever comes first.
//! A flush emits a DataLoss frame first when bytes were evicted, then one
//! (Compressed)Output frame; the ring is reset only after the send
//! succeeded, so a failed send keeps the bytes staged.
//!
//! All outbound frames funnel through one unbounded channel drained by the
//! connection's single writer task, which serializes sends from the
//! process loop and from the WebSocket handler (resyncs) in FIFO order.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    BACKGROUND_FLUSH_INTERVAL, COMPRESSION_THRESHOLD, OUTPUT_QUEUE_CAPACITY, PROCESS_LOOP_TICK,
};
use crate::mux::protocol;
use crate::mux::queue::DropOldestQueue;
use crate::mux::ring_buffer::SessionRingBuffer;
use crate::pool::BufferPool;

/// One ttyhost output event as shared by the fan-out.
#[derive(Debug, Clone)]
pub struct OutputItem {
    /// Originating session.
    pub session_id: String,
    /// Width the output was produced under.
    pub cols: u16,
    /// Height the output was produced under.
    pub rows: u16,
    /// Reference-counted output bytes (one copy shared by all clients).
    pub data: Bytes,
}

/// State shared between the handler, the fan-out and the process loop.
struct Shared {
    active_session: StdMutex<Option<String>>,
    /// Sessions queued for ring-buffer removal.
    removals: StdMutex<Vec<String>>,
    /// Items rejected by the full inbound queue since the last resync.
    dropped_frames: AtomicU64,
}

/// Per-browser-connection pipeline.
pub struct MuxClient {
    client_id: String,
    inbound: Arc<DropOldestQueue<OutputItem>>,
    shared: Arc<Shared>,
    out_tx: UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    loop_task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MuxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxClient")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl MuxClient {
    /// Create the pipeline and start its process loop.
    ///
    /// Encoded frames are pushed into `out_tx`; the connection's writer
    /// task drains them onto the socket.
    #[must_use]
    pub fn new(
        client_id: String,
        out_tx: UnboundedSender<Vec<u8>>,
        pool: Arc<BufferPool>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let inbound = Arc::new(DropOldestQueue::new(OUTPUT_QUEUE_CAPACITY));
        let shared = Arc::new(Shared {
            active_session: StdMutex::new(None),
            removals: StdMutex::new(Vec::new()),
            dropped_frames: AtomicU64::new(0),
        });

        let client = Arc::new(Self {
            client_id,
            inbound: Arc::clone(&inbound),
            shared: Arc::clone(&shared),
            out_tx: out_tx.clone(),
            cancel: cancel.clone(),
            loop_task: StdMutex::new(None),
        });

        let task = tokio::spawn(process_loop(inbound, shared, out_tx, pool, cancel));
        *client.loop_task.lock().expect("task mutex poisoned") = Some(task);
        client
    }

    /// Server-assigned client id (32 characters).
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Hand one shared output item to this client.
    ///
    /// Called by the fan-out task. When the inbound queue is full the
    /// oldest item is discarded and the dropped-frame counter incremented;
    /// the WebSocket handler notices and triggers a full resync.
    pub fn queue_output(&self, item: OutputItem) {
        let dropped = self.inbound.push(item);
        if dropped > 0 {
            self.shared.dropped_frames.fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }

    /// Queue a pre-encoded frame directly, bypassing the ring buffers
    /// (used for foreground-change notifications).
    pub fn queue_frame(&self, frame: Vec<u8>) {
        let _ = self.out_tx.send(frame);
    }

    /// Record which session the user is looking at.
    pub fn set_active_session(&self, session_id: Option<String>) {
        *self.shared.active_session.lock().expect("active mutex poisoned") = session_id;
    }

    /// Currently active session, if any.
    #[must_use]
    pub fn active_session(&self) -> Option<String> {
        self.shared.active_session.lock().expect("active mutex poisoned").clone()
    }

    /// Queue a session's ring buffer for removal (session closed).
    pub fn remove_session(&self, session_id: &str) {
        self.shared
            .removals
            .lock()
            .expect("removals mutex poisoned")
            .push(session_id.to_owned());
    }

    /// True when items have been dropped since the last resync.
    #[must_use]
    pub fn has_dropped_frames(&self) -> bool {
        self.shared.dropped_frames.load(Ordering::Relaxed) > 0
    }

    /// Read and reset the dropped-frame counter.
    pub fn take_dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.swap(0, Ordering::Relaxed)
    }

    /// Stop the process loop, drain the queue and return every pooled
    /// ring buffer. Idempotent.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        self.inbound.close();
        let task = self.loop_task.lock().expect("task mutex poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// The long-running per-client task: stage, then flush by policy.
async fn process_loop(
    inbound: Arc<DropOldestQueue<OutputItem>>,
    shared: Arc<Shared>,
    out_tx: UnboundedSender<Vec<u8>>,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
) {
    let mut rings: HashMap<String, SessionRingBuffer> = HashMap::new();

    loop {
        tokio::select! {
            item = inbound.pop() => match item {
                Some(item) => stage(&mut rings, &pool, item),
                None => break, // disposed
            },
            () = tokio::time::sleep(PROCESS_LOOP_TICK) => {}
            () = cancel.cancelled() => break,
        }

        // Drain whatever else queued up while we were waiting.
        while let Some(item) = inbound.try_pop() {
            stage(&mut rings, &pool, item);
        }

        // Apply queued removals before flushing.
        let removals: Vec<String> =
            std::mem::take(&mut *shared.removals.lock().expect("removals mutex poisoned"));
        for session_id in removals {
            rings.remove(&session_id);
        }

        let active = shared.active_session.lock().expect("active mutex poisoned").clone();
        for (session_id, ring) in &mut rings {
            let is_active = active.as_deref() == Some(session_id.as_str());
            let due = if is_active {
                ring.pending() > 0 || ring.dropped_bytes() > 0
            } else {
                ring.pending() >= COMPRESSION_THRESHOLD
                    || (ring.pending() > 0 && ring.since_last_flush() >= BACKGROUND_FLUSH_INTERVAL)
            };
            if due && !flush(session_id, ring, &out_tx) {
                // The connection is gone; keep the bytes staged (they
                // survive for a future resync) and stop trying.
                return;
            }
        }
    }

    // Rings drop here, returning their pooled buffers.
}

fn stage(rings: &mut HashMap<String, SessionRingBuffer>, pool: &Arc<BufferPool>, item: OutputItem) {
    let ring = rings
        .entry(item.session_id)
        .or_insert_with(|| SessionRingBuffer::new(pool));
    ring.set_dims(item.cols, item.rows);
    ring.write(&item.data);
}

/// Emit DataLoss (when bytes were evicted) then one (Compressed)Output
/// frame; reset the ring only when the send succeeded.
fn flush(session_id: &str, ring: &mut SessionRingBuffer, out_tx: &UnboundedSender<Vec<u8>>) -> bool {
    let dropped = ring.dropped_bytes();
    if dropped > 0 {
        let count = u32::try_from(dropped).unwrap_or(u32::MAX);
        if out_tx.send(protocol::encode_data_loss(session_id, count)).is_err() {
            return false;
        }
    }

    let (cols, rows) = ring.dims();
    let frame = protocol::encode_output_auto(session_id, cols, rows, ring.contents());
    if out_tx.send(frame).is_err() {
        return false;
    }

    ring.mark_flushed();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RING_CAPACITY;
    use crate::mux::protocol::OutboundFrame;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn item(session_id: &str, data: &[u8]) -> OutputItem {
        OutputItem {
            session_id: session_id.into(),
            cols: 80,
            rows: 24,
            data: Bytes::copy_from_slice(data),
        }
    }

    fn test_client() -> (Arc<MuxClient>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let client = MuxClient::new(
            "0123456789abcdef0123456789abcdef".into(),
            out_tx,
            BufferPool::new(),
            CancellationToken::new(),
        );
        (client, out_rx)
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, window: Duration) -> OutboundFrame {
        let bytes = tokio::time::timeout(window, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        protocol::decode_outbound(&bytes).expect("undecodable frame")
    }

    #[tokio::test]
    async fn test_active_session_flushes_immediately() {
        let (client, mut rx) = test_client();
        client.set_active_session(Some("abcd1234".into()));
        client.queue_output(item("abcd1234", b"prompt$ "));

        let frame = next_frame(&mut rx, Duration::from_millis(500)).await;
        match frame {
            OutboundFrame::Output { session_id, data, .. } => {
                assert_eq!(session_id, "abcd1234");
                assert_eq!(data, b"prompt$ ");
            }
            other => panic!("expected Output, got {other:?}"),
        }
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_background_small_chunk_coalesces_for_two_seconds() {
        // 200 background bytes produce nothing for ~2 s, then land as one
        // 200-byte Output frame.
        let (client, mut rx) = test_client();
        client.set_active_session(Some("active00".into()));
        let sent_at = Instant::now();
        client.queue_output(item("backgrnd", &[0x42u8; 200]));

        let frame = next_frame(&mut rx, Duration::from_secs(4)).await;
        let elapsed = sent_at.elapsed();
        assert!(elapsed >= Duration::from_millis(1900), "flushed too early: {elapsed:?}");
        match frame {
            OutboundFrame::Output { session_id, data, .. } => {
                assert_eq!(session_id, "backgrnd");
                assert_eq!(data.len(), 200);
            }
            other => panic!("expected Output, got {other:?}"),
        }
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_background_flushes_at_size_threshold() {
        let (client, mut rx) = test_client();
        client.set_active_session(Some("active00".into()));
        let sent_at = Instant::now();
        client.queue_output(item("backgrnd", &vec![0x41u8; 2048]));

        let frame = next_frame(&mut rx, Duration::from_millis(1500)).await;
        assert!(sent_at.elapsed() < Duration::from_millis(1500));
        match frame {
            OutboundFrame::CompressedOutput { data, .. } => assert_eq!(data.len(), 2048),
            other => panic!("expected CompressedOutput, got {other:?}"),
        }
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_active_session_compresses_above_threshold() {
        // 2048 active bytes exceed the threshold and arrive as
        // CompressedOutput announcing uncompressedLen 2048.
        let (client, mut rx) = test_client();
        client.set_active_session(Some("abcd1234".into()));
        client.queue_output(item("abcd1234", &vec![0x41u8; 2048]));

        match next_frame(&mut rx, Duration::from_millis(500)).await {
            OutboundFrame::CompressedOutput { session_id, data, .. } => {
                assert_eq!(session_id, "abcd1234");
                assert_eq!(data, vec![0x41u8; 2048]);
            }
            other => panic!("expected CompressedOutput, got {other:?}"),
        }
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_overflow_emits_data_loss_then_output() {
        // One 300 KiB write overflows the 256 KiB ring; the flush leads
        // with DataLoss(44 KiB) and then the tail bytes.
        let (client, mut rx) = test_client();
        client.set_active_session(Some("abcd1234".into()));
        client.queue_output(item("abcd1234", &vec![0x41u8; 300 * 1024]));

        match next_frame(&mut rx, Duration::from_millis(500)).await {
            OutboundFrame::DataLoss { session_id, dropped_bytes } => {
                assert_eq!(session_id, "abcd1234");
                assert_eq!(dropped_bytes, (44 * 1024) as u32);
            }
            other => panic!("expected DataLoss, got {other:?}"),
        }
        match next_frame(&mut rx, Duration::from_millis(500)).await {
            OutboundFrame::CompressedOutput { data, .. } => {
                assert_eq!(data.len(), RING_CAPACITY);
                assert!(data.iter().all(|&b| b == 0x41));
            }
            other => panic!("expected CompressedOutput, got {other:?}"),
        }
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_dropped_frame_counter_on_queue_overflow() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        // A cancelled loop never drains the queue, simulating a wedged
        // process loop.
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = MuxClient::new(
            "0123456789abcdef0123456789abcdef".into(),
            out_tx,
            BufferPool::new(),
            cancel,
        );
        // Give the loop a moment to observe the cancellation.
        tokio::time::sleep(Duration::from_millis(50)).await;

        for i in 0..1100u32 {
            client.queue_output(item("abcd1234", &i.to_le_bytes()));
        }
        assert!(client.has_dropped_frames());
        assert_eq!(client.take_dropped_frames(), 100);
        assert!(!client.has_dropped_frames());
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_remove_session_drops_staged_output() {
        let (client, mut rx) = test_client();
        // Background session with data below every threshold.
        client.set_active_session(Some("active00".into()));
        client.queue_output(item("backgrnd", b"doomed"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.remove_session("backgrnd");

        // Nothing may arrive for the removed session.
        let got = tokio::time::timeout(Duration::from_millis(2600), rx.recv()).await;
        assert!(got.is_err(), "removed session still flushed: {got:?}");
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_returns_pooled_buffers() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let pool = BufferPool::new();
        let client = MuxClient::new(
            "0123456789abcdef0123456789abcdef".into(),
            out_tx,
            Arc::clone(&pool),
            CancellationToken::new(),
        );
        client.queue_output(item("abcd1234", b"data"));
        client.queue_output(item("deadbeef", b"data"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        client.dispose().await;
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_direct_frame_bypasses_buffers() {
        let (client, mut rx) = test_client();
        client.queue_frame(protocol::encode_clear_screen("abcd1234"));
        match next_frame(&mut rx, Duration::from_millis(200)).await {
            OutboundFrame::ClearScreen { session_id } => assert_eq!(session_id, "abcd1234"),
            other => panic!("expected ClearScreen, got {other:?}"),
        }
        client.dispose().await;
    }
}
