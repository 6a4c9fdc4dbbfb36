//! The ttyhost's IPC server: one mt connection at a time.
//!
//! Binds `mthost-<id>-<pid>.sock` in the per-user transport directory and
//! serves mt connections sequentially. When mt disconnects (e.g. it is
//! restarting) the ttyhost keeps running and re-accepts; scrollback
//! accumulated during the gap replays through GetBuffer. A Close frame is
//! the only way mt ends the session: the ttyhost acks it, kills the
//! shell, removes its socket file and exits.

// Rust guideline compliant 2026-02

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};

use crate::ipc::endpoint;
use crate::ipc::framing::{FrameDecoder, IpcFrame};
use crate::ttyhost::{level_filter_from_byte, HostState};

/// Why a connection ended.
enum ConnectionEnd {
    /// mt went away; keep serving.
    Disconnected,
    /// mt sent Close; shut the ttyhost down.
    Closed,
}

/// Bind the endpoint and serve mt connections until Close.
pub fn serve(state: &Arc<HostState>) -> Result<()> {
    endpoint::ensure_transport_dir()?;
    let socket_path = endpoint::socket_path(state.session_id(), std::process::id())?;

    // A crashed predecessor with the same pid is impossible; an existing
    // file is leftover debris.
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("bind endpoint: {}", socket_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600));
    }
    log::info!("[ttyhost] listening on {}", socket_path.display());

    // The socket file disappears however serve() exits.
    let _cleanup = scopeguard::guard(socket_path.clone(), |path| {
        let _ = std::fs::remove_file(path);
    });

    loop {
        let (stream, _) = listener.accept().context("accept mt connection")?;
        log::info!("[ttyhost] mt connected");
        match handle_connection(stream, state) {
            ConnectionEnd::Closed => {
                state.kill_shell();
                return Ok(());
            }
            ConnectionEnd::Disconnected => {
                log::info!("[ttyhost] mt disconnected, awaiting reconnect");
            }
        }
    }
}

/// Handle one mt connection until it drops or sends Close.
fn handle_connection(mut stream: UnixStream, state: &Arc<HostState>) -> ConnectionEnd {
    // One channel carries control acks and PTY output alike; the writer
    // thread delivers them in FIFO order so an ack can never overtake the
    // output that preceded it.
    let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();

    // Re-wire the reader/waiter/poller threads to this connection.
    {
        let mut writer = state.writer.lock().expect("writer mutex poisoned");
        *writer = Some(tx.clone());
    }

    let write_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            log::error!("[ttyhost] clone socket for writer: {e}");
            return ConnectionEnd::Disconnected;
        }
    };
    let writer_thread = thread::spawn(move || {
        let mut stream = write_stream;
        for frame in rx {
            // Empty sentinel: connection teardown. No real IPC frame is
            // empty (the header alone is five bytes).
            if frame.is_empty() {
                break;
            }
            if stream.write_all(&frame).is_err() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 64 * 1024];
    let mut end = ConnectionEnd::Disconnected;

    'connection: loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::warn!("[ttyhost] read error: {e}");
                break;
            }
        };
        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("[ttyhost] corrupt frame from mt: {e}");
                break;
            }
        };

        for frame in frames {
            match frame {
                IpcFrame::GetInfo => {
                    let info = IpcFrame::Info(state.session_snapshot());
                    let _ = tx.send(info.encode());
                }
                IpcFrame::GetBuffer => {
                    let _ = tx.send(IpcFrame::Buffer(state.scrollback_bytes()).encode());
                }
                IpcFrame::Input(data) => state.write_input(&data),
                IpcFrame::Resize { cols, rows } => {
                    let cols = u16::try_from(cols).unwrap_or(u16::MAX).max(1);
                    let rows = u16::try_from(rows).unwrap_or(u16::MAX).max(1);
                    state.resize(cols, rows);
                    let _ = tx.send(IpcFrame::ResizeAck.encode());
                }
                IpcFrame::SetName(name) => {
                    state.set_manual_name(name);
                    let _ = tx.send(IpcFrame::SetNameAck.encode());
                }
                IpcFrame::SetOrder(order) => {
                    state.set_order(order);
                    let _ = tx.send(IpcFrame::SetOrderAck.encode());
                }
                IpcFrame::SetLogLevel(byte) => {
                    log::set_max_level(level_filter_from_byte(byte));
                    let _ = tx.send(IpcFrame::SetLogLevelAck.encode());
                }
                IpcFrame::Close => {
                    log::info!("[ttyhost] close requested");
                    let _ = tx.send(IpcFrame::CloseAck.encode());
                    end = ConnectionEnd::Closed;
                    break 'connection;
                }
                other => {
                    log::warn!(
                        "[ttyhost] unexpected frame 0x{:02x} from mt",
                        other.frame_type()
                    );
                }
            }
        }
    }

    // Detach the shared writer first so reader threads stop queueing into
    // a dead channel, then let the writer drain and exit.
    {
        let mut writer = state.writer.lock().expect("writer mutex poisoned");
        *writer = None;
    }
    let _ = tx.send(Vec::new());
    drop(tx);
    let _ = writer_thread.join();

    end
}
