//! Spawning and verifying ttyhost subprocesses.
//!
//! The `mthost` binary lives adjacent to the `mt` binary. Before the first
//! spawn its SHA-256 is checked against a checksum manifest in the install
//! directory; a mismatch aborts the spawn, a missing manifest allows it
//! (development mode) with a log line. Both the integrity result and the
//! probed `--version` output are cached for the lifetime of the mt process.
//!
//! When mt runs privileged and a target user is configured, the spawn is
//! wrapped in `sudo -n -u <user>`; the wrapper's pid is then NOT the
//! ttyhost's pid, so the real pid is re-resolved by scanning the transport
//! directory for an endpoint with the matching session id.

// Rust guideline compliant 2026-02

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

use crate::ipc::endpoint;

/// Name of the ttyhost binary next to the mt binary.
#[cfg(not(windows))]
const TTYHOST_BINARY: &str = "mthost";
#[cfg(windows)]
const TTYHOST_BINARY: &str = "mthost.exe";

/// Checksum manifest file name in the install directory.
const CHECKSUM_MANIFEST: &str = "checksums.sha256";

/// Backoff schedule for re-resolving the real pid after a wrapped spawn.
const PID_RESOLVE_BACKOFF: [Duration; 4] = [
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(400),
];

/// Parameters for spawning one ttyhost.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// 8-hex session id assigned by the session manager.
    pub session_id: String,
    /// Shell to run; the ttyhost falls back to `$SHELL` when absent.
    pub shell: Option<String>,
    /// Working directory for the shell.
    pub cwd: Option<PathBuf>,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
    /// Drop privileges to this user before exec (requires mt to run
    /// privileged).
    pub as_user: Option<String>,
}

/// A spawned ttyhost whose endpoint may not exist yet.
#[derive(Debug)]
pub struct SpawnedHost {
    /// The ttyhost's real pid (re-resolved when spawned through a
    /// privilege-dropping wrapper).
    pub pid: u32,
    /// Direct child handle when no wrapper was used.
    pub child: Option<Child>,
}

/// Validate a privilege-drop username against the strict format rule.
///
/// Accepts `^[a-z_][a-z0-9_-]{0,31}$` — the portable POSIX username shape.
#[must_use]
pub fn is_valid_username(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 32 {
        return false;
    }
    let first_ok = bytes[0].is_ascii_lowercase() || bytes[0] == b'_';
    first_ok
        && bytes[1..]
            .iter()
            .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

/// Path to the ttyhost binary adjacent to the current executable.
///
/// Installed layouts put `mthost` next to `mt`; in a cargo target tree
/// the running executable may live one level deeper (`deps/`), so the
/// parent directory is checked as a fallback.
pub fn ttyhost_binary_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("resolve current executable")?;
    let dir = exe
        .parent()
        .context("current executable has no parent directory")?;
    let adjacent = dir.join(TTYHOST_BINARY);
    if adjacent.exists() {
        return Ok(adjacent);
    }
    if let Some(parent) = dir.parent() {
        let above = parent.join(TTYHOST_BINARY);
        if above.exists() {
            return Ok(above);
        }
    }
    Ok(adjacent)
}

/// Verify the ttyhost binary's SHA-256 against the install manifest.
///
/// The manifest holds `<hex>  <filename>` lines. A successful check is
/// cached process-wide; a missing manifest allows the spawn (development
/// mode) but is logged.
pub fn verify_integrity(binary: &Path) -> Result<()> {
    static VERIFIED: OnceLock<std::sync::Mutex<std::collections::HashSet<PathBuf>>> =
        OnceLock::new();
    let verified = VERIFIED.get_or_init(|| std::sync::Mutex::new(std::collections::HashSet::new()));
    if verified
        .lock()
        .expect("integrity cache poisoned")
        .contains(binary)
    {
        return Ok(());
    }

    let manifest = binary
        .parent()
        .map(|dir| dir.join(CHECKSUM_MANIFEST))
        .context("ttyhost binary has no parent directory")?;

    let manifest_text = match std::fs::read_to_string(&manifest) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::warn!(
                "[spawn] no checksum manifest at {}; skipping integrity check (development mode)",
                manifest.display()
            );
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("read manifest: {}", manifest.display()))
        }
    };

    let file_name = binary
        .file_name()
        .and_then(|n| n.to_str())
        .context("ttyhost binary has no file name")?;

    let expected = manifest_text
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some((parts.next()?, parts.next()?))
        })
        .find(|(_, name)| *name == file_name)
        .map(|(hex, _)| hex.to_ascii_lowercase());

    let Some(expected) = expected else {
        bail!("checksum manifest has no entry for {file_name}");
    };

    let contents = std::fs::read(binary)
        .with_context(|| format!("read ttyhost binary: {}", binary.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    let actual = format!("{:x}", hasher.finalize());

    if actual != expected {
        bail!("ttyhost integrity check failed: expected {expected}, got {actual}");
    }

    verified
        .lock()
        .expect("integrity cache poisoned")
        .insert(binary.to_path_buf());
    log::info!("[spawn] ttyhost integrity verified ({file_name})");
    Ok(())
}

/// Report the ttyhost binary's version, probed once per mt process.
pub fn probe_version() -> Result<String> {
    static VERSION: OnceLock<Result<String, String>> = OnceLock::new();
    let cached = VERSION.get_or_init(|| {
        let binary = ttyhost_binary_path().map_err(|e| e.to_string())?;
        let output = Command::new(&binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("invoke {} --version: {e}", binary.display()))?;
        if !output.status.success() {
            return Err(format!("{} --version exited with {}", binary.display(), output.status));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        // Output shape: "mthost 0.5.1".
        text.split_whitespace()
            .last()
            .map(str::to_owned)
            .ok_or_else(|| "empty --version output".to_owned())
    });
    cached.clone().map_err(|e| anyhow::anyhow!(e))
}

/// Spawn a ttyhost for `req`, verifying integrity first.
///
/// On success the endpoint `mthost-<id>-<pid>` will appear in the transport
/// directory once the ttyhost finishes binding; the caller waits for it
/// with its own backoff.
pub async fn spawn_ttyhost(req: &SpawnRequest) -> Result<SpawnedHost> {
    let binary = ttyhost_binary_path()?;
    if !binary.exists() {
        bail!("ttyhost binary missing: {}", binary.display());
    }
    verify_integrity(&binary)?;

    let mut args: Vec<String> = vec![
        "--session".into(),
        req.session_id.clone(),
        "--cols".into(),
        req.cols.to_string(),
        "--rows".into(),
        req.rows.to_string(),
    ];
    if let Some(shell) = &req.shell {
        args.push("--shell".into());
        args.push(shell.clone());
    }
    if let Some(cwd) = &req.cwd {
        args.push("--cwd".into());
        args.push(cwd.to_string_lossy().into_owned());
    }

    let mut command = match &req.as_user {
        Some(user) => {
            // Revalidate at the point of use; the value may have come from
            // configuration long ago.
            if !is_valid_username(user) {
                bail!("refusing to drop privileges to malformed username {user:?}");
            }
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg("-u").arg(user).arg(&binary).args(&args);
            cmd
        }
        None => {
            let mut cmd = Command::new(&binary);
            cmd.args(&args);
            cmd
        }
    };

    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn ttyhost for session {}", req.session_id))?;

    if req.as_user.is_some() {
        // The wrapper's pid is not the ttyhost's pid; find the real one by
        // watching for the session's endpoint to appear.
        let pid = resolve_real_pid(&req.session_id).await?;
        log::info!(
            "[spawn] session {}: wrapped spawn, resolved real pid {pid}",
            req.session_id
        );
        Ok(SpawnedHost { pid, child: Some(child) })
    } else {
        Ok(SpawnedHost { pid: child.id(), child: Some(child) })
    }
}

/// Scan the transport directory for this session's endpoint, with
/// exponential backoff, and return the pid embedded in its name.
async fn resolve_real_pid(session_id: &str) -> Result<u32> {
    let dir = endpoint::transport_dir();
    for delay in PID_RESOLVE_BACKOFF {
        tokio::time::sleep(delay).await;
        for ep in endpoint::enumerate_endpoints(&dir).unwrap_or_default() {
            if ep.session_id == session_id {
                return Ok(ep.pid);
            }
        }
    }
    bail!("no endpoint appeared for session {session_id} after wrapped spawn");
}

/// Send SIGTERM to a pid, escalating to SIGKILL after a short grace.
pub fn kill_pid(pid: u32) {
    let pid = pid as libc::pid_t;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    std::thread::sleep(Duration::from_millis(200));
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

/// True when a process with this pid exists (signal 0 probe).
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
