//! Fan-out of ttyhost output to every connected browser client.
//!
//! Subscribes once to the session manager's output/closed/foreground
//! events. Output lands on one global bounded queue (DropOldest); a single
//! consumer task hands each item to every registered [`MuxClient`]. The
//! per-item work is O(number of clients) — all per-client buffering lives
//! on the per-client task, which is what keeps a slow client from
//! blocking a fast one.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::task::JoinHandle;

use crate::constants::OUTPUT_QUEUE_CAPACITY;
use crate::mux::client::{MuxClient, OutputItem};
use crate::mux::protocol;
use crate::mux::queue::DropOldestQueue;
use crate::session::listeners::ListenerHandle;
use crate::session::manager::SessionManager;

/// Owner of the global output queue and the client registry.
pub struct MuxConnectionManager {
    clients: StdMutex<HashMap<String, Arc<MuxClient>>>,
    queue: Arc<DropOldestQueue<OutputItem>>,
    fanout_task: StdMutex<Option<JoinHandle<()>>>,
    /// Keep the session-manager subscriptions alive.
    _subscriptions: Vec<ListenerHandle>,
}

impl std::fmt::Debug for MuxConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnectionManager")
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl MuxConnectionManager {
    /// Create the fan-out and subscribe it to `sessions`.
    #[must_use]
    pub fn new(sessions: &SessionManager) -> Arc<Self> {
        let queue: Arc<DropOldestQueue<OutputItem>> =
            Arc::new(DropOldestQueue::new(OUTPUT_QUEUE_CAPACITY));

        // Subscriptions hold only weak references so the session manager
        // cannot keep a dead fan-out alive.
        let this = Arc::new_cyclic(|weak: &Weak<Self>| {
            let queue_for_output = Arc::clone(&queue);
            let output_sub = sessions.on_output(move |event| {
                // The pooled copy already happened upstream: `data` is a
                // refcounted handle every client shares.
                queue_for_output.push(OutputItem {
                    session_id: event.session_id.clone(),
                    cols: event.cols,
                    rows: event.rows,
                    data: event.data.clone(),
                });
            });

            let weak_for_closed = weak.clone();
            let closed_sub = sessions.on_session_closed(move |session_id: &String| {
                if let Some(manager) = weak_for_closed.upgrade() {
                    for client in manager.clients_snapshot() {
                        client.remove_session(session_id);
                    }
                }
            });

            let weak_for_fg = weak.clone();
            let foreground_sub = sessions.on_foreground_changed(move |event| {
                let Some(manager) = weak_for_fg.upgrade() else { return };
                // Serialize once, share the encoding across clients.
                let json = match serde_json::to_vec(&event.foreground) {
                    Ok(json) => json,
                    Err(e) => {
                        log::error!("[mux] foreground serialization failed: {e}");
                        return;
                    }
                };
                let frame = protocol::encode_foreground_change(&event.session_id, &json);
                for client in manager.clients_snapshot() {
                    client.queue_frame(frame.clone());
                }
            });

            Self {
                clients: StdMutex::new(HashMap::new()),
                queue: Arc::clone(&queue),
                fanout_task: StdMutex::new(None),
                _subscriptions: vec![output_sub, closed_sub, foreground_sub],
            }
        });

        let weak = Arc::downgrade(&this);
        let task = tokio::spawn(fanout_loop(queue, weak));
        *this.fanout_task.lock().expect("task mutex poisoned") = Some(task);

        this
    }

    /// Register a connected browser's pipeline.
    pub fn register_client(&self, client: Arc<MuxClient>) {
        let id = client.client_id().to_owned();
        self.clients.lock().expect("clients mutex poisoned").insert(id, client);
    }

    /// Remove a disconnected browser's pipeline.
    pub fn unregister_client(&self, client_id: &str) {
        self.clients.lock().expect("clients mutex poisoned").remove(client_id);
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("clients mutex poisoned").len()
    }

    fn clients_snapshot(&self) -> Vec<Arc<MuxClient>> {
        self.clients
            .lock()
            .expect("clients mutex poisoned")
            .values()
            .map(Arc::clone)
            .collect()
    }

    /// Stop the fan-out and dispose every client pipeline.
    pub async fn shutdown(&self) {
        self.queue.close();
        let task = self.fanout_task.lock().expect("task mutex poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let clients: Vec<Arc<MuxClient>> = self
            .clients
            .lock()
            .expect("clients mutex poisoned")
            .drain()
            .map(|(_, c)| c)
            .collect();
        for client in clients {
            client.dispose().await;
        }
    }
}

/// Single consumer: visit every registered client per item, sequentially,
/// so output from one ttyhost reaches all clients in read order.
async fn fanout_loop(queue: Arc<DropOldestQueue<OutputItem>>, manager: Weak<MuxConnectionManager>) {
    while let Some(item) = queue.pop().await {
        let Some(manager) = manager.upgrade() else { break };
        for client in manager.clients_snapshot() {
            client.queue_output(item.clone());
        }
    }
    log::debug!("[mux] fan-out task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::protocol::OutboundFrame;
    use crate::pool::BufferPool;
    use crate::session::manager::ManagerConfig;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn browser(id_suffix: char) -> (Arc<MuxClient>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let id: String = std::iter::repeat(id_suffix).take(32).collect();
        let client = MuxClient::new(id, out_tx, BufferPool::new(), CancellationToken::new());
        (client, out_rx)
    }

    async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> OutboundFrame {
        let bytes = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        protocol::decode_outbound(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_output_reaches_every_registered_client() {
        let sessions = SessionManager::new(ManagerConfig::default());
        let mux = MuxConnectionManager::new(&sessions);

        let (c1, mut rx1) = browser('a');
        let (c2, mut rx2) = browser('b');
        c1.set_active_session(Some("abcd1234".into()));
        c2.set_active_session(Some("abcd1234".into()));
        mux.register_client(Arc::clone(&c1));
        mux.register_client(Arc::clone(&c2));

        // Inject an output event the way the session dispatch task would.
        mux.queue.push(OutputItem {
            session_id: "abcd1234".into(),
            cols: 80,
            rows: 24,
            data: Bytes::from_static(b"shared"),
        });

        for rx in [&mut rx1, &mut rx2] {
            match recv_frame(rx).await {
                OutboundFrame::Output { session_id, data, .. } => {
                    assert_eq!(session_id, "abcd1234");
                    assert_eq!(data, b"shared");
                }
                other => panic!("expected Output, got {other:?}"),
            }
        }
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_client_receives_nothing() {
        let sessions = SessionManager::new(ManagerConfig::default());
        let mux = MuxConnectionManager::new(&sessions);

        let (c1, mut rx1) = browser('a');
        c1.set_active_session(Some("abcd1234".into()));
        mux.register_client(Arc::clone(&c1));
        mux.unregister_client(c1.client_id());

        mux.queue.push(OutputItem {
            session_id: "abcd1234".into(),
            cols: 80,
            rows: 24,
            data: Bytes::from_static(b"nope"),
        });

        let got = tokio::time::timeout(Duration::from_millis(300), rx1.recv()).await;
        assert!(got.is_err());
        c1.dispose().await;
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_disposes_clients() {
        let sessions = SessionManager::new(ManagerConfig::default());
        let mux = MuxConnectionManager::new(&sessions);
        let (c1, _rx1) = browser('a');
        mux.register_client(c1);
        mux.shutdown().await;
        assert_eq!(mux.client_count(), 0);
    }
}
