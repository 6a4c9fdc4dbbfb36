//! The ttyhost: a per-session subprocess that owns one pseudo-terminal.
//!
//! # Purpose
//!
//! mt delegates PTY ownership to one `mthost` process per session. Because
//! the ttyhost outlives any single mt connection, sessions survive an mt
//! restart: the new mt discovers the endpoint, reconnects, and replays the
//! scrollback.
//!
//! # Architecture
//!
//! ```text
//! mt ──connect──► mthost-<id>-<pid>.sock
//!    ──GetInfo──►            ◄──Info── (session JSON)
//!    ──Input───►  PTY master ◄──Output── (cols, rows, bytes)
//!    ──Resize──►             ◄──ResizeAck──
//!
//! mt disconnects → ttyhost keeps running, scrollback keeps filling
//! mt reconnects  → GetBuffer replays the ring
//! Close          → CloseAck, kill shell, remove socket, exit
//! ```
//!
//! Threads: the blocking socket accept loop (main), one PTY reader, one
//! child waiter, one foreground poller, and a writer per mt connection.
//! All of them forward frames through a shared writer slot that each new
//! mt connection re-wires, so a reconnect never restarts the readers.

// Rust guideline compliant 2026-02

pub mod foreground;
pub mod pty;
pub mod scrollback;
pub mod server;

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use portable_pty::{Child, ChildKiller, MasterPty};

use crate::ipc::framing::{self, IpcFrame};
use crate::session::{ForegroundProcess, Session, StateChange};
use crate::ttyhost::scrollback::Scrollback;

/// How often the foreground poller samples the PTY's process group.
const FOREGROUND_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Command-line parameters of the `mthost` binary.
#[derive(Debug, Clone)]
pub struct TtyHostArgs {
    /// Session id assigned by mt.
    pub session_id: String,
    /// Shell to run; falls back to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    /// Working directory for the shell.
    pub cwd: Option<PathBuf>,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
}

/// Shared writer slot — re-wired on every mt connect and reconnect.
///
/// Reader threads lock it per frame; `None` during the reconnect window
/// means output is dropped from the live stream (it stays in the
/// scrollback and replays via GetBuffer).
pub(crate) type SharedWriter = Arc<Mutex<Option<std::sync::mpsc::Sender<Vec<u8>>>>>;

/// Everything the ttyhost's threads share.
pub struct HostState {
    session_id: String,
    shell_name: String,
    created_at: DateTime<Utc>,
    user: Option<String>,
    dims: Mutex<(u16, u16)>,
    title: Mutex<Option<String>>,
    has_manual_name: AtomicBool,
    order: AtomicU8,
    running: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    foreground: Mutex<Option<ForegroundProcess>>,
    scrollback: Mutex<Scrollback>,
    writer: SharedWriter,
    pty_writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl HostState {
    /// Session id assigned by mt.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue an encoded frame for the current mt connection, if any.
    pub(crate) fn send_frame(&self, frame: Vec<u8>) {
        if let Ok(guard) = self.writer.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(frame);
            }
        }
    }

    /// Build the `Info` payload from current state.
    pub(crate) fn session_snapshot(&self) -> Session {
        let (cols, rows) = *self.dims.lock().expect("dims mutex poisoned");
        Session {
            id: self.session_id.clone(),
            shell: self.shell_name.clone(),
            cols,
            rows,
            host_pid: std::process::id(),
            is_running: self.running.load(Ordering::Relaxed),
            exit_code: *self.exit_code.lock().expect("exit mutex poisoned"),
            created_at: self.created_at,
            user: self.user.clone(),
            title: self.title.lock().expect("title mutex poisoned").clone(),
            has_manual_name: self.has_manual_name.load(Ordering::Relaxed),
            foreground: self.foreground.lock().expect("foreground mutex poisoned").clone(),
            order: self.order.load(Ordering::Relaxed),
            version: crate::VERSION.to_owned(),
        }
    }

    /// Write input bytes to the PTY.
    pub(crate) fn write_input(&self, data: &[u8]) {
        let mut writer = self.pty_writer.lock().expect("pty writer mutex poisoned");
        if let Err(e) = writer.write_all(data) {
            log::warn!("[ttyhost] PTY input write failed: {e}");
        }
    }

    /// Resize the PTY and remember the new dimensions.
    pub(crate) fn resize(&self, cols: u16, rows: u16) {
        let master = self.master.lock().expect("master mutex poisoned");
        if let Err(e) = pty::resize_master(master.as_ref(), cols, rows) {
            log::warn!("[ttyhost] resize to {cols}x{rows} failed: {e}");
            return;
        }
        *self.dims.lock().expect("dims mutex poisoned") = (cols, rows);
    }

    pub(crate) fn set_manual_name(&self, name: Option<String>) {
        self.has_manual_name.store(name.is_some(), Ordering::Relaxed);
        *self.title.lock().expect("title mutex poisoned") = name;
    }

    pub(crate) fn set_order(&self, order: u8) {
        self.order.store(order, Ordering::Relaxed);
    }

    pub(crate) fn scrollback_bytes(&self) -> Vec<u8> {
        self.scrollback.lock().expect("scrollback mutex poisoned").to_vec()
    }

    /// Kill the shell (used on Close).
    pub(crate) fn kill_shell(&self) {
        let mut killer = self.killer.lock().expect("killer mutex poisoned");
        if let Err(e) = killer.kill() {
            log::debug!("[ttyhost] shell kill: {e}");
        }
    }
}

/// Run the ttyhost until mt sends Close (or the process is killed).
pub fn run(args: &TtyHostArgs) -> Result<()> {
    let shell = pty::resolve_shell(args.shell.as_deref());
    let session = pty::spawn_shell(&shell, args.cwd.as_deref(), args.cols, args.rows)?;
    let child_pid = session.child_pid;

    let state = Arc::new(HostState {
        session_id: args.session_id.clone(),
        shell_name: pty::shell_name(&shell),
        created_at: Utc::now(),
        user: std::env::var("USER").ok(),
        dims: Mutex::new((args.cols, args.rows)),
        title: Mutex::new(None),
        has_manual_name: AtomicBool::new(false),
        order: AtomicU8::new(0),
        running: AtomicBool::new(true),
        exit_code: Mutex::new(None),
        foreground: Mutex::new(None),
        scrollback: Mutex::new(Scrollback::default()),
        writer: Arc::new(Mutex::new(None)),
        pty_writer: Mutex::new(session.writer),
        master: Mutex::new(session.master),
        killer: Mutex::new(session.killer),
    });

    // Reader: PTY output → scrollback + Output frames.
    let reader_state = Arc::clone(&state);
    let reader = session.reader;
    thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || reader_loop(reader, &reader_state))
        .context("spawn reader thread")?;

    // Waiter: shell exit → StateChange frame.
    let waiter_state = Arc::clone(&state);
    let child = session.child;
    thread::Builder::new()
        .name("child-waiter".into())
        .spawn(move || waiter_loop(child, child_pid, &waiter_state))
        .context("spawn waiter thread")?;

    // Foreground poller.
    let fg_state = Arc::clone(&state);
    thread::Builder::new()
        .name("fg-poller".into())
        .spawn(move || foreground_loop(&fg_state))
        .context("spawn foreground poller")?;

    // Serve mt connections until Close.
    server::serve(&state)?;

    log::info!("[ttyhost] session {} closed, exiting", args.session_id);
    Ok(())
}

/// PTY reader loop: every chunk goes to the scrollback and, when mt is
/// connected, out as an Output frame carrying the current dimensions.
fn reader_loop(mut reader: Box<dyn std::io::Read + Send>, state: &Arc<HostState>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break, // shell exited or PTY torn down
            Ok(n) => {
                let data = &buf[..n];

                if let Some(title) = pty::scan_title(data) {
                    if !state.has_manual_name.load(Ordering::Relaxed) {
                        *state.title.lock().expect("title mutex poisoned") = Some(title);
                    }
                }

                state
                    .scrollback
                    .lock()
                    .expect("scrollback mutex poisoned")
                    .push(data);

                let (cols, rows) = *state.dims.lock().expect("dims mutex poisoned");
                state.send_frame(framing::encode_output(cols, rows, data));
            }
        }
    }
    log::debug!("[ttyhost] PTY reader exiting");
}

/// Child waiter: report the shell's exit through StateChange.
fn waiter_loop(mut child: Box<dyn Child + Send + Sync>, child_pid: u32, state: &Arc<HostState>) {
    let exit_code = match child.wait() {
        Ok(status) => Some(status.exit_code() as i32),
        Err(e) => {
            log::warn!("[ttyhost] wait for shell failed: {e}");
            None
        }
    };

    state.running.store(false, Ordering::Relaxed);
    *state.exit_code.lock().expect("exit mutex poisoned") = exit_code;
    log::info!("[ttyhost] shell {child_pid} exited with {exit_code:?}");

    let change = StateChange { is_running: false, exit_code };
    state.send_frame(IpcFrame::StateChange(change).encode());
    state.send_frame(
        IpcFrame::ProcessEvent(serde_json::json!({
            "event": "exited",
            "pid": child_pid,
        }))
        .encode(),
    );
}

/// Foreground poller: sample the PTY's foreground process group and report
/// changes.
fn foreground_loop(state: &Arc<HostState>) {
    let mut last_pid: Option<u32> = None;
    loop {
        thread::sleep(FOREGROUND_POLL_INTERVAL);
        if !state.running.load(Ordering::Relaxed) {
            break;
        }

        let leader = state
            .master
            .lock()
            .expect("master mutex poisoned")
            .process_group_leader();
        let Some(pid) = leader.filter(|&p| p > 0).map(|p| p as u32) else {
            continue;
        };
        if last_pid == Some(pid) {
            continue;
        }
        last_pid = Some(pid);

        let fg = foreground::describe_process(pid);
        *state.foreground.lock().expect("foreground mutex poisoned") = Some(fg.clone());
        state.send_frame(IpcFrame::ForegroundChange(fg.clone()).encode());
        state.send_frame(IpcFrame::ProcessSnapshot(foreground::snapshot_payload(&fg)).encode());
    }
    log::debug!("[ttyhost] foreground poller exiting");
}

/// Map the one-byte wire severity to a `log` level filter.
#[must_use]
pub fn level_filter_from_byte(byte: u8) -> log::LevelFilter {
    match byte {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_mapping_round_trips() {
        for byte in 0u8..=5 {
            let filter = level_filter_from_byte(byte);
            let back = match filter {
                log::LevelFilter::Off => 0,
                log::LevelFilter::Error => 1,
                log::LevelFilter::Warn => 2,
                log::LevelFilter::Info => 3,
                log::LevelFilter::Debug => 4,
                log::LevelFilter::Trace => 5,
            };
            assert_eq!(byte, back);
        }
    }

    #[test]
    fn test_high_bytes_clamp_to_trace() {
        assert_eq!(level_filter_from_byte(200), log::LevelFilter::Trace);
    }
}
