//! The binary mux WebSocket channel.
//!
//! Connection sequence:
//!
//! 1. Auth check (401 before upgrade on failure).
//! 2. Init frame: protocol version + the server-assigned client id.
//! 3. Initial buffer sync: every known session's scrollback as 64 KiB
//!    chunked (Compressed)Output frames.
//! 4. Receive loop: TerminalInput / Resize / BufferRequest /
//!    ActiveSessionHint; unknown types log and continue.
//! 5. After each handled frame, a set dropped-frame flag triggers
//!    ClearScreen-per-session plus a full buffer resync.
//!
//! All sends go through one writer task fed by an unbounded channel, so
//! process-loop flushes and handler resyncs interleave in FIFO order. An
//! empty frame on that channel is the shutdown sentinel: the writer sends
//! a Close with the ServerShutdown code and exits (no real frame is ever
//! empty; the mux header alone is 9 bytes).

// Rust guideline compliant 2026-02

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::constants::SERVER_SHUTDOWN_CLOSE_CODE;
use crate::mux::client::MuxClient;
use crate::mux::protocol::{self, InboundFrame};
use crate::pool::BufferPool;
use crate::server::AppState;

/// GET /ws — upgrade to the binary mux channel.
pub async fn mux_ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.auth_ok(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_mux_socket(socket, state))
}

/// Generate a 32-hex-character client id.
fn generate_client_id() -> String {
    format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}

async fn handle_mux_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = generate_client_id();
    log::info!("[mux-ws] client connected: {client_id}");

    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(writer_loop(ws_tx, out_rx));

    let client = MuxClient::new(
        client_id.clone(),
        out_tx.clone(),
        Arc::clone(BufferPool::global()),
        state.shutdown.child_token(),
    );
    state.mux.register_client(Arc::clone(&client));

    // Step 2: init frame first, always.
    let _ = out_tx.send(protocol::encode_init(&client_id));
    // Step 3: initial buffers.
    send_all_buffers(&state, &out_tx).await;

    receive_loop(&state, &client, ws_rx, &out_tx).await;

    state.mux.unregister_client(&client_id);
    client.dispose().await;
    // Dropping the last sender ends the writer; abort covers the case
    // where the socket sink is wedged.
    drop(out_tx);
    writer.abort();
    log::info!("[mux-ws] client disconnected: {client_id}");
}

/// Step 4: the receive loop, with shutdown observation.
async fn receive_loop(
    state: &Arc<AppState>,
    client: &Arc<MuxClient>,
    mut ws_rx: SplitStream<WebSocket>,
    out_tx: &UnboundedSender<Vec<u8>>,
) {
    loop {
        tokio::select! {
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Binary(bytes))) => {
                        handle_inbound(state, client, &bytes, out_tx).await;
                        // Step 5: a set dropped flag means this client fell
                        // behind; clear its screens and replay everything.
                        if client.has_dropped_frames() {
                            resync(state, out_tx).await;
                            client.take_dropped_frames();
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // text/ping/pong: nothing to do
                    Some(Err(e)) => {
                        log::warn!("[mux-ws] receive error: {e}");
                        break;
                    }
                }
            }
            () = state.shutdown.cancelled() => {
                // Writer sentinel → Close(ServerShutdown).
                let _ = out_tx.send(Vec::new());
                break;
            }
        }
    }
}

async fn handle_inbound(
    state: &Arc<AppState>,
    client: &Arc<MuxClient>,
    bytes: &[u8],
    out_tx: &UnboundedSender<Vec<u8>>,
) {
    let frame = match protocol::decode_inbound(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("[mux-ws] undecodable frame from {}: {e}", client.client_id());
            return;
        }
    };

    match frame {
        InboundFrame::TerminalInput { session_id, data } => {
            state.sessions.send_input(&session_id, &data).await;
        }
        InboundFrame::Resize { session_id, cols, rows } => {
            if !state.sessions.resize(&session_id, cols, rows).await {
                log::debug!("[mux-ws] resize for unknown session {session_id}");
            }
        }
        InboundFrame::BufferRequest { session_id } => {
            send_session_buffer(state, &session_id, out_tx).await;
        }
        InboundFrame::ActiveSessionHint { session_id } => {
            client.set_active_session(Some(session_id));
        }
        InboundFrame::Unknown { frame_type } => {
            log::warn!(
                "[mux-ws] unknown frame type 0x{frame_type:02x} from {}",
                client.client_id()
            );
        }
    }
}

/// Fetch one session's scrollback and send it as chunked frames.
async fn send_session_buffer(
    state: &Arc<AppState>,
    session_id: &str,
    out_tx: &UnboundedSender<Vec<u8>>,
) -> bool {
    let Some(session) = state.sessions.get_session(session_id) else {
        log::debug!("[mux-ws] buffer request for unknown session {session_id}");
        return true;
    };
    let Some(buffer) = state.sessions.get_buffer(session_id).await else {
        log::warn!("[mux-ws] could not fetch buffer for session {session_id}");
        return true;
    };
    for frame in protocol::encode_replay_chunks(session_id, session.cols, session.rows, &buffer) {
        if out_tx.send(frame).is_err() {
            return false;
        }
    }
    true
}

/// Initial sync: every known session's buffer; abort the remainder on the
/// first failed send.
async fn send_all_buffers(state: &Arc<AppState>, out_tx: &UnboundedSender<Vec<u8>>) {
    for session in state.sessions.session_list() {
        if !send_session_buffer(state, &session.id, out_tx).await {
            log::warn!("[mux-ws] initial sync aborted (send failed)");
            return;
        }
    }
}

/// Backpressure recovery: ClearScreen for every known session, then a
/// fresh replay of every buffer.
async fn resync(state: &Arc<AppState>, out_tx: &UnboundedSender<Vec<u8>>) {
    log::info!("[mux-ws] dropped frames detected; resyncing client");
    for session in state.sessions.session_list() {
        if out_tx.send(protocol::encode_clear_screen(&session.id)).is_err() {
            return;
        }
    }
    send_all_buffers(state, out_tx).await;
}

/// Single writer: drains encoded frames onto the socket in FIFO order.
async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = out_rx.recv().await {
        if frame.is_empty() {
            // Shutdown sentinel.
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: SERVER_SHUTDOWN_CLOSE_CODE,
                    reason: "ServerShutdown".into(),
                })))
                .await;
            break;
        }
        if sink.send(Message::Binary(frame.into())).await.is_err() {
            break;
        }
    }
}
