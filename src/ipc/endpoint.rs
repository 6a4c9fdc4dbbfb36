//! Endpoint naming and discovery for ttyhost transports.
//!
//! mt and each ttyhost rendezvous at a deterministic name:
//!
//! ```text
//! mthost-<sessionId>-<pid>
//! ```
//!
//! On socket platforms the endpoint is a UNIX domain socket file
//! `<name>.sock` inside a per-user 0700 directory under the platform temp
//! root. The directory can be enumerated to discover orphaned ttyhosts
//! after an mt restart.

// Rust guideline compliant 2026-01

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Endpoint name prefix shared by mt and every ttyhost.
pub const ENDPOINT_PREFIX: &str = "mthost-";

/// Socket file extension on socket platforms.
const SOCKET_EXT: &str = "sock";

/// Maximum path length for a UNIX domain socket (macOS kernel limit).
const MAX_SOCK_PATH: usize = 104;

/// Build the endpoint name for a session/pid pair.
#[must_use]
pub fn endpoint_name(session_id: &str, pid: u32) -> String {
    format!("{ENDPOINT_PREFIX}{session_id}-{pid}")
}

/// Parse an endpoint name back into `(session_id, pid)`.
///
/// The id must be 1–64 lowercase hex characters and the pid at least 1;
/// anything else is rejected. The pid is split from the id at the LAST
/// dash so that the grammar stays unambiguous.
#[must_use]
pub fn parse_endpoint_name(name: &str) -> Option<(String, u32)> {
    let rest = name.strip_prefix(ENDPOINT_PREFIX)?;
    let (id, pid_str) = rest.rsplit_once('-')?;
    if !crate::session::is_valid_session_id(id) {
        return None;
    }
    if pid_str.is_empty() || !pid_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let pid: u32 = pid_str.parse().ok()?;
    if pid == 0 {
        return None;
    }
    Some((id.to_owned(), pid))
}

/// The per-user transport directory: `<tempRoot>/mt-<uid>`.
#[must_use]
pub fn transport_dir() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    std::env::temp_dir().join(format!("mt-{uid}"))
}

/// Create the transport directory with mode 0700 if it does not exist.
pub fn ensure_transport_dir() -> Result<PathBuf> {
    let dir = transport_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create transport dir: {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("chmod transport dir: {}", dir.display()))?;
    }
    Ok(dir)
}

/// Full socket path for a session/pid pair, validated against the OS
/// socket-path limit.
pub fn socket_path(session_id: &str, pid: u32) -> Result<PathBuf> {
    let path = transport_dir().join(format!("{}.{SOCKET_EXT}", endpoint_name(session_id, pid)));
    let path_str = path.to_string_lossy();
    if path_str.len() > MAX_SOCK_PATH {
        anyhow::bail!(
            "socket path too long ({} > {MAX_SOCK_PATH}): {path_str}",
            path_str.len()
        );
    }
    Ok(path)
}

/// A discovered endpoint in the transport directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Session id parsed from the file name.
    pub session_id: String,
    /// ttyhost pid parsed from the file name.
    pub pid: u32,
    /// Full path to the socket file.
    pub path: PathBuf,
}

/// Enumerate all well-formed `mthost-<id>-<pid>.sock` endpoints in `dir`.
///
/// Files that do not match the grammar are ignored. A missing directory
/// yields an empty list (nothing was ever spawned).
pub fn enumerate_endpoints(dir: &Path) -> Result<Vec<Endpoint>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read transport dir: {}", dir.display())),
    };

    let mut endpoints = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SOCKET_EXT) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some((session_id, pid)) = parse_endpoint_name(stem) {
            endpoints.push(Endpoint { session_id, pid, path });
        }
    }
    Ok(endpoints)
}
