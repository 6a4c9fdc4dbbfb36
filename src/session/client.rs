//! Per-session IPC client owning one connection to one ttyhost.
//!
//! # Request/response correlation
//!
//! All request/ack pairs are strictly ordered per connection: no second
//! request is issued until the previous ack arrives or the 3-second window
//! elapses. There is no multiplexing of in-flight requests because each
//! ttyhost has a single owner. Writes are serialized through one mutex;
//! reads are handled by a dedicated loop task.
//!
//! # Handshake ordering
//!
//! After `connect` succeeds the sequence is: (1) send GetInfo, (2) await
//! Info, (3) subscribe to events, (4) start the continuous read loop. The
//! read loop must not start before step 2, otherwise an Output frame
//! arriving between steps 1 and 2 could race the Info read — so the first
//! `get_info` reads the stream directly and only then hands the remaining
//! decoder state to the loop.
//!
//! # Failure model
//!
//! Any read error or unparseable frame transitions to Closing without
//! retry; the session is then reaped by the manager. A write error during
//! `send_input` is swallowed (input loss is tolerable; the user retries).
//! A write error during a request fails that request and closes the client.

// Rust guideline compliant 2026-02

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::constants::REQUEST_TIMEOUT;
use crate::ipc::framing::{self, frame_type, FrameDecoder, IpcFrame};
use crate::session::{ForegroundProcess, Session, StateChange};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No transport.
    Disconnected,
    /// Endpoint open in progress.
    Connecting,
    /// Transport open, Info not yet received.
    Handshaking,
    /// Info received; events flow to subscribers.
    Ready,
    /// Close requested or transport failed; no more traffic.
    Closing,
    /// Read loop exited.
    Closed,
}

/// Events a ttyhost pushes to the session manager.
#[derive(Debug, Clone)]
pub enum TtyHostEvent {
    /// PTY output with the dimensions it was produced under.
    Output {
        /// Owning session.
        session_id: String,
        /// Terminal width in columns.
        cols: u16,
        /// Terminal height in rows.
        rows: u16,
        /// Raw output bytes.
        data: Vec<u8>,
    },
    /// The shell's running state changed.
    StateChanged {
        /// Owning session.
        session_id: String,
        /// New state.
        change: StateChange,
    },
    /// Opaque process lifecycle event.
    ProcessEvent {
        /// Owning session.
        session_id: String,
        /// JSON payload, forwarded untouched.
        payload: serde_json::Value,
    },
    /// The PTY's foreground process changed.
    ForegroundChanged {
        /// Owning session.
        session_id: String,
        /// New foreground process.
        foreground: ForegroundProcess,
    },
    /// The connection is gone; the manager reaps the session.
    Disconnected {
        /// Owning session.
        session_id: String,
    },
}

/// An in-flight request waiting for its ack frame.
struct PendingAck {
    ack_type: u8,
    tx: oneshot::Sender<IpcFrame>,
}

/// Full-duplex connection to one ttyhost.
pub struct TtyHostClient {
    session_id: String,
    state: Arc<StdMutex<ClientState>>,
    /// Single write path; every request — including fire-and-forget input —
    /// acquires it.
    write_half: Mutex<Option<OwnedWriteHalf>>,
    /// Read half held only between connect and read-loop start.
    idle_reader: StdMutex<Option<(OwnedReadHalf, FrameDecoder)>>,
    /// Serializes request/ack pairs (one in flight).
    request_lane: Mutex<()>,
    pending_ack: Arc<StdMutex<Option<PendingAck>>>,
    read_task: StdMutex<Option<JoinHandle<()>>>,
    event_tx: UnboundedSender<TtyHostEvent>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for TtyHostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtyHostClient")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TtyHostClient {
    /// Create a client for `session_id`; events go to `event_tx`.
    #[must_use]
    pub fn new(session_id: String, event_tx: UnboundedSender<TtyHostEvent>) -> Self {
        Self {
            session_id,
            state: Arc::new(StdMutex::new(ClientState::Disconnected)),
            write_half: Mutex::new(None),
            idle_reader: StdMutex::new(None),
            request_lane: Mutex::new(()),
            pending_ack: Arc::new(StdMutex::new(None)),
            read_task: StdMutex::new(None),
            event_tx,
            disposed: AtomicBool::new(false),
        }
    }

    /// Owning session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.state.lock().expect("state mutex poisoned")
    }

    fn set_state(&self, next: ClientState) {
        *self.state.lock().expect("state mutex poisoned") = next;
    }

    /// Open the transport. On success the client is Handshaking and the
    /// first [`get_info`](Self::get_info) completes the handshake.
    pub async fn connect(&self, socket_path: &Path, timeout: Duration) -> Result<()> {
        self.set_state(ClientState::Connecting);
        let stream = match tokio::time::timeout(timeout, UnixStream::connect(socket_path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ClientState::Disconnected);
                return Err(e)
                    .with_context(|| format!("connect {}", socket_path.display()));
            }
            Err(_) => {
                self.set_state(ClientState::Disconnected);
                bail!("connect to {} timed out", socket_path.display());
            }
        };

        let (read_half, write_half) = stream.into_split();
        *self.write_half.lock().await = Some(write_half);
        *self.idle_reader.lock().expect("reader mutex poisoned") =
            Some((read_half, FrameDecoder::new()));
        self.set_state(ClientState::Handshaking);
        Ok(())
    }

    /// Fetch session metadata.
    ///
    /// The first call after `connect` performs the handshake: it reads the
    /// stream directly until Info arrives (discarding anything earlier with
    /// a warning), then starts the continuous read loop. Later calls go
    /// through the ordinary request lane.
    pub async fn get_info(&self, timeout: Duration) -> Result<Session> {
        match self.state() {
            ClientState::Handshaking => self.handshake_get_info(timeout).await,
            ClientState::Ready => {
                match self.request(&IpcFrame::GetInfo, frame_type::INFO, timeout).await? {
                    IpcFrame::Info(session) => Ok(session),
                    other => bail!("expected Info, got {other:?}"),
                }
            }
            state => bail!("get_info in state {state:?}"),
        }
    }

    async fn handshake_get_info(&self, timeout: Duration) -> Result<Session> {
        let _lane = self.request_lane.lock().await;

        let Some((mut reader, mut decoder)) = self
            .idle_reader
            .lock()
            .expect("reader mutex poisoned")
            .take()
        else {
            bail!("handshake reader already taken for session {}", self.session_id);
        };

        if let Err(e) = self.write_frame(&IpcFrame::GetInfo.encode()).await {
            self.set_state(ClientState::Closing);
            return Err(e);
        }

        let session = tokio::time::timeout(timeout, async {
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = reader.read(&mut buf).await.context("handshake read")?;
                if n == 0 {
                    bail!("ttyhost closed during handshake");
                }
                for frame in decoder.feed(&buf[..n])? {
                    match frame {
                        IpcFrame::Info(session) => return Ok(session),
                        other => log::warn!(
                            "[ttyhost-client] {}: discarding pre-handshake frame 0x{:02x}",
                            self.session_id,
                            other.frame_type()
                        ),
                    }
                }
            }
        })
        .await
        .map_err(|_| {
            self.set_state(ClientState::Closing);
            anyhow::anyhow!("GetInfo timed out for session {}", self.session_id)
        })?;

        let session = match session {
            Ok(session) => session,
            Err(e) => {
                self.set_state(ClientState::Closing);
                return Err(e);
            }
        };

        // Handshake complete: subscribers are wired (event_tx), start the
        // continuous read loop with whatever the decoder still buffers.
        self.set_state(ClientState::Ready);
        let task = tokio::spawn(read_loop(
            self.session_id.clone(),
            reader,
            decoder,
            Arc::clone(&self.state),
            Arc::clone(&self.pending_ack),
            self.event_tx.clone(),
        ));
        *self.read_task.lock().expect("task mutex poisoned") = Some(task);

        Ok(session)
    }

    /// Fetch the ttyhost's scrollback buffer.
    pub async fn get_buffer(&self) -> Option<Vec<u8>> {
        match self
            .request(&IpcFrame::GetBuffer, frame_type::BUFFER, REQUEST_TIMEOUT)
            .await
        {
            Ok(IpcFrame::Buffer(data)) => Some(data),
            Ok(other) => {
                log::warn!("[ttyhost-client] {}: expected Buffer, got {other:?}", self.session_id);
                None
            }
            Err(e) => {
                log::warn!("[ttyhost-client] {}: get_buffer failed: {e}", self.session_id);
                None
            }
        }
    }

    /// Write raw input bytes, fire-and-forget.
    ///
    /// Input loss on a write error is tolerable (the user will retry), so
    /// errors are logged and swallowed.
    pub async fn send_input(&self, data: &[u8]) {
        if self.state() != ClientState::Ready {
            log::warn!("[ttyhost-client] {}: dropping input while not ready", self.session_id);
            return;
        }
        let frame = framing::encode(frame_type::INPUT, data);
        if let Err(e) = self.write_frame(&frame).await {
            log::warn!("[ttyhost-client] {}: input write failed (dropped): {e}", self.session_id);
        }
    }

    /// Resize the PTY.
    pub async fn resize(&self, cols: u16, rows: u16) -> bool {
        self.simple_request(
            &IpcFrame::Resize { cols: i32::from(cols), rows: i32::from(rows) },
            frame_type::RESIZE_ACK,
        )
        .await
    }

    /// Set or clear the manual session name.
    pub async fn set_name(&self, name: Option<&str>) -> bool {
        self.simple_request(
            &IpcFrame::SetName(name.map(str::to_owned)),
            frame_type::SET_NAME_ACK,
        )
        .await
    }

    /// Push a display-order byte.
    pub async fn set_order(&self, order: u8) -> bool {
        self.simple_request(&IpcFrame::SetOrder(order), frame_type::SET_ORDER_ACK)
            .await
    }

    /// Push a log severity byte.
    pub async fn set_log_level(&self, level: u8) -> bool {
        self.simple_request(&IpcFrame::SetLogLevel(level), frame_type::SET_LOG_LEVEL_ACK)
            .await
    }

    /// Ask the ttyhost to close, waiting up to `timeout` for its ack.
    pub async fn close(&self, timeout: Duration) -> bool {
        let ok = match self.request(&IpcFrame::Close, frame_type::CLOSE_ACK, timeout).await {
            Ok(IpcFrame::CloseAck) => true,
            Ok(other) => {
                log::warn!("[ttyhost-client] {}: expected CloseAck, got {other:?}", self.session_id);
                false
            }
            Err(e) => {
                log::warn!("[ttyhost-client] {}: close failed: {e}", self.session_id);
                false
            }
        };
        self.set_state(ClientState::Closing);
        ok
    }

    /// Tear the client down. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.read_task.lock().expect("task mutex poisoned").take() {
            task.abort();
        }
        *self.write_half.lock().await = None;
        *self.idle_reader.lock().expect("reader mutex poisoned") = None;
        self.set_state(ClientState::Closed);
    }

    async fn simple_request(&self, frame: &IpcFrame, ack_type: u8) -> bool {
        match self.request(frame, ack_type, REQUEST_TIMEOUT).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!(
                    "[ttyhost-client] {}: request 0x{:02x} failed: {e}",
                    self.session_id,
                    frame.frame_type()
                );
                false
            }
        }
    }

    /// Issue one request and await its ack, strictly ordered.
    async fn request(&self, frame: &IpcFrame, ack_type: u8, timeout: Duration) -> Result<IpcFrame> {
        let _lane = self.request_lane.lock().await;

        if self.state() != ClientState::Ready {
            bail!("session {} not ready", self.session_id);
        }

        let (tx, rx) = oneshot::channel();
        *self.pending_ack.lock().expect("ack mutex poisoned") = Some(PendingAck { ack_type, tx });

        if let Err(e) = self.write_frame(&frame.encode()).await {
            *self.pending_ack.lock().expect("ack mutex poisoned") = None;
            self.set_state(ClientState::Closing);
            return Err(e).context("request write failed");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => bail!("connection closed awaiting ack 0x{ack_type:02x}"),
            Err(_) => {
                *self.pending_ack.lock().expect("ack mutex poisoned") = None;
                bail!("ack 0x{ack_type:02x} timed out for session {}", self.session_id)
            }
        }
    }

    async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.write_half.lock().await;
        let writer = guard
            .as_mut()
            .with_context(|| format!("session {} has no transport", self.session_id))?;
        writer.write_all(bytes).await.context("transport write")?;
        Ok(())
    }
}

/// Continuous read loop: routes acks to the pending request and pushes
/// data frames to subscribers while Ready.
async fn read_loop(
    session_id: String,
    mut reader: OwnedReadHalf,
    mut decoder: FrameDecoder,
    state: Arc<StdMutex<ClientState>>,
    pending_ack: Arc<StdMutex<Option<PendingAck>>>,
    event_tx: UnboundedSender<TtyHostEvent>,
) {
    let mut buf = [0u8; 64 * 1024];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("[ttyhost-client] {session_id}: ttyhost closed the connection");
                break;
            }
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        dispatch_frame(&session_id, frame, &state, &pending_ack, &event_tx);
                    }
                }
                Err(e) => {
                    log::error!("[ttyhost-client] {session_id}: frame decode error: {e}");
                    break;
                }
            },
            Err(e) => {
                log::error!("[ttyhost-client] {session_id}: read error: {e}");
                break;
            }
        }
    }

    *state.lock().expect("state mutex poisoned") = ClientState::Closing;
    // Fail any in-flight request so its caller unblocks immediately.
    pending_ack.lock().expect("ack mutex poisoned").take();
    let _ = event_tx.send(TtyHostEvent::Disconnected { session_id: session_id.clone() });
    *state.lock().expect("state mutex poisoned") = ClientState::Closed;
}

fn dispatch_frame(
    session_id: &str,
    frame: IpcFrame,
    state: &Arc<StdMutex<ClientState>>,
    pending_ack: &Arc<StdMutex<Option<PendingAck>>>,
    event_tx: &UnboundedSender<TtyHostEvent>,
) {
    let frame_type = frame.frame_type();

    // Ack band: fulfill the pending request if the type matches.
    if matches!(
        frame,
        IpcFrame::Info(_)
            | IpcFrame::Buffer(_)
            | IpcFrame::ResizeAck
            | IpcFrame::SetNameAck
            | IpcFrame::SetOrderAck
            | IpcFrame::CloseAck
            | IpcFrame::SetLogLevelAck
    ) {
        let pending = {
            let mut guard = pending_ack.lock().expect("ack mutex poisoned");
            match guard.as_ref() {
                Some(p) if p.ack_type == frame_type => guard.take(),
                _ => None,
            }
        };
        match pending {
            Some(p) => {
                let _ = p.tx.send(frame);
            }
            None => log::warn!(
                "[ttyhost-client] {session_id}: unexpected ack 0x{frame_type:02x} with no pending request"
            ),
        }
        return;
    }

    let ready = *state.lock().expect("state mutex poisoned") == ClientState::Ready;
    if !ready {
        log::warn!("[ttyhost-client] {session_id}: discarding frame 0x{frame_type:02x} while not ready");
        return;
    }

    let event = match frame {
        IpcFrame::Output { cols, rows, data } => Some(TtyHostEvent::Output {
            session_id: session_id.to_owned(),
            cols,
            rows,
            data,
        }),
        IpcFrame::StateChange(change) => Some(TtyHostEvent::StateChanged {
            session_id: session_id.to_owned(),
            change,
        }),
        IpcFrame::ProcessEvent(payload) => Some(TtyHostEvent::ProcessEvent {
            session_id: session_id.to_owned(),
            payload,
        }),
        IpcFrame::ForegroundChange(foreground) => Some(TtyHostEvent::ForegroundChanged {
            session_id: session_id.to_owned(),
            foreground,
        }),
        IpcFrame::ProcessSnapshot(snapshot) => {
            // Frontend treatment is out of scope; keep it visible for
            // debugging.
            log::debug!("[ttyhost-client] {session_id}: process snapshot: {snapshot}");
            None
        }
        other => {
            log::warn!(
                "[ttyhost-client] {session_id}: unexpected frame 0x{:02x} from ttyhost",
                other.frame_type()
            );
            None
        }
    };

    if let Some(event) = event {
        let _ = event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DISCOVERY_CONNECT_TIMEOUT;
    use chrono::Utc;
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;

    fn sample_session(id: &str) -> Session {
        Session {
            id: id.into(),
            shell: "bash".into(),
            cols: 80,
            rows: 24,
            host_pid: 4242,
            is_running: true,
            exit_code: None,
            created_at: Utc::now(),
            user: None,
            title: None,
            has_manual_name: false,
            foreground: None,
            order: 0,
            version: "0.5.1".into(),
        }
    }

    /// Minimal fake ttyhost: answers GetInfo with Info, echoes acks.
    async fn fake_ttyhost(listener: UnixListener, session: Session, pre_info_output: bool) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for frame in decoder.feed(&buf[..n]).unwrap() {
                let reply = match frame {
                    IpcFrame::GetInfo => {
                        if pre_info_output {
                            // Race an Output ahead of Info; the handshake
                            // must discard it.
                            let out = framing::encode_output(80, 24, b"early");
                            stream.write_all(&out).await.unwrap();
                        }
                        Some(IpcFrame::Info(session.clone()).encode())
                    }
                    IpcFrame::GetBuffer => Some(IpcFrame::Buffer(b"scrollback".to_vec()).encode()),
                    IpcFrame::Resize { .. } => Some(IpcFrame::ResizeAck.encode()),
                    IpcFrame::SetOrder(_) => Some(IpcFrame::SetOrderAck.encode()),
                    IpcFrame::SetName(_) => Some(IpcFrame::SetNameAck.encode()),
                    IpcFrame::SetLogLevel(_) => Some(IpcFrame::SetLogLevelAck.encode()),
                    IpcFrame::Close => Some(IpcFrame::CloseAck.encode()),
                    _ => None,
                };
                if let Some(reply) = reply {
                    stream.write_all(&reply).await.unwrap();
                }
            }
        }
    }

    async fn connected_client(
        pre_info_output: bool,
    ) -> (Arc<TtyHostClient>, mpsc::UnboundedReceiver<TtyHostEvent>, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock = tmp.path().join("mthost-abcd1234-1.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        tokio::spawn(fake_ttyhost(listener, sample_session("abcd1234"), pre_info_output));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client = Arc::new(TtyHostClient::new("abcd1234".into(), event_tx));
        client.connect(&sock, DISCOVERY_CONNECT_TIMEOUT).await.unwrap();
        (client, event_rx, tmp)
    }

    #[tokio::test]
    async fn test_connect_then_info_reaches_ready() {
        let (client, _rx, _tmp) = connected_client(false).await;
        assert_eq!(client.state(), ClientState::Handshaking);

        let session = client.get_info(REQUEST_TIMEOUT).await.unwrap();
        assert_eq!(session.id, "abcd1234");
        assert_eq!(client.state(), ClientState::Ready);
    }

    #[tokio::test]
    async fn test_handshake_discards_early_output() {
        let (client, mut rx, _tmp) = connected_client(true).await;
        let session = client.get_info(REQUEST_TIMEOUT).await.unwrap();
        assert_eq!(session.id, "abcd1234");
        // The racing Output was consumed during handshake, not delivered.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_requests_after_ready() {
        let (client, _rx, _tmp) = connected_client(false).await;
        client.get_info(REQUEST_TIMEOUT).await.unwrap();

        assert!(client.resize(100, 30).await);
        assert!(client.set_order(5).await);
        assert!(client.set_name(Some("build")).await);
        assert!(client.set_log_level(3).await);
        assert_eq!(client.get_buffer().await.unwrap(), b"scrollback");
    }

    #[tokio::test]
    async fn test_close_acknowledged() {
        let (client, _rx, _tmp) = connected_client(false).await;
        client.get_info(REQUEST_TIMEOUT).await.unwrap();
        assert!(client.close(Duration::from_secs(2)).await);
        assert_eq!(client.state(), ClientState::Closing);
        client.dispose().await;
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_peer_disconnect_emits_event() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock = tmp.path().join("mthost-abcd1234-1.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        // A ttyhost that answers Info then drops the connection.
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let info = IpcFrame::Info(sample_session("abcd1234")).encode();
            stream.write_all(&info).await.unwrap();
            // Give the client time to finish the handshake, then vanish.
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let client = TtyHostClient::new("abcd1234".into(), event_tx);
        client.connect(&sock, DISCOVERY_CONNECT_TIMEOUT).await.unwrap();
        client.get_info(REQUEST_TIMEOUT).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert!(matches!(event, TtyHostEvent::Disconnected { .. }));
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_connect_timeout_to_missing_socket() {
        let (event_tx, _rx) = mpsc::unbounded_channel();
        let client = TtyHostClient::new("abcd1234".into(), event_tx);
        let err = client
            .connect(Path::new("/nonexistent/mthost-abcd1234-1.sock"), Duration::from_millis(200))
            .await;
        assert!(err.is_err());
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (client, _rx, _tmp) = connected_client(false).await;
        client.get_info(REQUEST_TIMEOUT).await.unwrap();
        client.dispose().await;
        client.dispose().await;
        assert_eq!(client.state(), ClientState::Closed);
    }
}
