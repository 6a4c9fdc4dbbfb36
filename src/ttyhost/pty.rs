//! PTY lifecycle for the ttyhost.
//!
//! Opens the pseudo-terminal, spawns the shell into it, and provides the
//! reader/writer endpoints the rest of the ttyhost uses. Also scans output
//! for OSC title sequences so the session can carry a terminal-reported
//! title.

// Rust guideline compliant 2026-01

use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};

/// A spawned shell attached to a PTY.
pub struct PtySession {
    /// Master side; used for resize and foreground-group queries.
    pub master: Box<dyn MasterPty + Send>,
    /// Write end for keyboard input.
    pub writer: Box<dyn std::io::Write + Send>,
    /// Read end for output.
    pub reader: Box<dyn std::io::Read + Send>,
    /// The shell process; `wait` consumes it on the waiter thread.
    pub child: Box<dyn Child + Send + Sync>,
    /// Kills the shell without needing `&mut child`.
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    /// Shell pid.
    pub child_pid: u32,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("child_pid", &self.child_pid)
            .finish_non_exhaustive()
    }
}

/// Open a PTY of the given size and spawn `shell` into it.
pub fn spawn_shell(
    shell: &str,
    cwd: Option<&Path>,
    cols: u16,
    rows: u16,
) -> Result<PtySession> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
        .context("open PTY")?;

    let mut cmd = CommandBuilder::new(shell);
    if let Some(cwd) = cwd {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");

    let child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("spawn shell {shell:?}"))?;
    drop(pair.slave);

    let killer = child.clone_killer();
    let child_pid = child.process_id().context("shell has no pid")?;
    let writer = pair.master.take_writer().context("take PTY writer")?;
    let reader = pair.master.try_clone_reader().context("clone PTY reader")?;

    log::info!("[ttyhost] spawned shell {shell:?} (pid {child_pid}, {cols}x{rows})");
    Ok(PtySession {
        master: pair.master,
        writer,
        reader,
        child,
        killer,
        child_pid,
    })
}

/// Resize a PTY master.
pub fn resize_master(master: &dyn MasterPty, cols: u16, rows: u16) -> Result<()> {
    master
        .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
        .context("resize PTY")
}

/// Resolve the shell to run: explicit argument, then `$SHELL`, then sh.
#[must_use]
pub fn resolve_shell(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_owned)
        .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "/bin/sh".to_owned())
}

/// The short shell name for the session entity ("bash", "zsh", ...).
#[must_use]
pub fn shell_name(shell: &str) -> String {
    Path::new(shell)
        .file_name()
        .map_or_else(|| shell.to_owned(), |n| n.to_string_lossy().into_owned())
}

/// Scan a chunk of output for the LAST OSC 0/2 title sequence.
///
/// Recognizes `ESC ] 0 ; title BEL`, `ESC ] 2 ; title BEL` and the
/// `ESC \` string terminator. Titles split across read boundaries are
/// missed; terminals re-send titles often enough that this does not
/// matter in practice.
#[must_use]
pub fn scan_title(data: &[u8]) -> Option<String> {
    let mut found = None;
    let mut i = 0;
    while i + 4 < data.len() {
        if data[i] == 0x1b
            && data[i + 1] == b']'
            && (data[i + 2] == b'0' || data[i + 2] == b'2')
            && data[i + 3] == b';'
        {
            let start = i + 4;
            let mut end = start;
            let mut terminator = 0usize;
            while end < data.len() {
                if data[end] == 0x07 {
                    terminator = 1;
                    break;
                }
                if data[end] == 0x1b && data.get(end + 1) == Some(&b'\\') {
                    terminator = 2;
                    break;
                }
                end += 1;
            }
            if terminator > 0 {
                if let Ok(title) = std::str::from_utf8(&data[start..end]) {
                    found = Some(title.to_owned());
                }
                i = end + terminator;
                continue;
            }
        }
        i += 1;
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_shell_prefers_explicit() {
        assert_eq!(resolve_shell(Some("/bin/bash")), "/bin/bash");
    }

    #[test]
    fn test_resolve_shell_falls_back() {
        // Whatever the environment, the result is never empty.
        assert!(!resolve_shell(None).is_empty());
    }

    #[test]
    fn test_shell_name_is_basename() {
        assert_eq!(shell_name("/usr/bin/zsh"), "zsh");
        assert_eq!(shell_name("bash"), "bash");
    }

    #[test]
    fn test_scan_title_bel_terminated() {
        let data = b"before\x1b]0;my title\x07after";
        assert_eq!(scan_title(data).as_deref(), Some("my title"));
    }

    #[test]
    fn test_scan_title_st_terminated() {
        let data = b"\x1b]2;vim src/main.rs\x1b\\rest";
        assert_eq!(scan_title(data).as_deref(), Some("vim src/main.rs"));
    }

    #[test]
    fn test_scan_title_takes_last() {
        let data = b"\x1b]0;first\x07middle\x1b]2;second\x07";
        assert_eq!(scan_title(data).as_deref(), Some("second"));
    }

    #[test]
    fn test_scan_title_ignores_other_osc() {
        let data = b"\x1b]52;c;encoded\x07plain output";
        assert_eq!(scan_title(data), None);
    }

    #[test]
    fn test_scan_title_unterminated_is_none() {
        assert_eq!(scan_title(b"\x1b]0;never ends"), None);
    }

    #[test]
    fn test_spawn_shell_basic() {
        // May fail in exotic CI sandboxes without PTY support; the
        // assertions only run when the spawn itself worked.
        if let Ok(session) = spawn_shell("/bin/sh", None, 80, 24) {
            assert!(session.child_pid > 0);
        }
    }
}
