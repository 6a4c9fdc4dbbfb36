//! Session model and lifecycle management.
//!
//! A [`Session`] is one live pseudo-terminal together with the ttyhost
//! subprocess that owns it, identified by an 8-hex-character id. The entity
//! is created when a ttyhost is spawned (or discovered at startup), mutated
//! only by its owning [`client::TtyHostClient`]'s event stream, and
//! destroyed when the ttyhost exits or an explicit close succeeds.

pub mod client;
pub mod host_process;
pub mod listeners;
pub mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a fresh 8-hex-character session id.
#[must_use]
pub fn generate_session_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Returns true if `id` is a well-formed session id (lowercase hex).
#[must_use]
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Descriptor of the process currently in the foreground of a PTY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForegroundProcess {
    /// Process id of the foreground process group leader.
    pub pid: u32,
    /// Short process name (comm).
    pub name: String,
    /// Full command line, when readable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    /// Working directory, when readable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// One live PTY session with its owning ttyhost.
///
/// Serialized as the `Info` IPC payload (UTF-8 JSON) and embedded in the
/// state channel's session list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// 8-hex-character opaque id.
    pub id: String,
    /// Shell type name (e.g. "bash", "zsh").
    pub shell: String,
    /// Current PTY width in columns.
    pub cols: u16,
    /// Current PTY height in rows.
    pub rows: u16,
    /// ttyhost process id.
    pub host_pid: u32,
    /// Whether the shell process is still running.
    pub is_running: bool,
    /// Exit code once the shell has exited. `None` while running or on
    /// signal death.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// When the ttyhost created the PTY.
    pub created_at: DateTime<Utc>,
    /// User the shell runs as, when privilege dropping is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Terminal-reported (OSC) or manually assigned title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// True when the title was set explicitly via SetName rather than by
    /// the terminal.
    #[serde(default)]
    pub has_manual_name: bool,
    /// Foreground process of the PTY, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground: Option<ForegroundProcess>,
    /// Display-order byte cached by the ttyhost (0–255).
    #[serde(default)]
    pub order: u8,
    /// ttyhost binary version string.
    pub version: String,
}

/// `StateChange` IPC payload: `{isRunning, exitCode?}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    /// Whether the shell process is still running.
    pub is_running: bool,
    /// Exit code when it has exited normally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Session DTO for the state channel.
///
/// Mirrors [`Session`] but carries the session manager's fresh order (an
/// int), not the ttyhost's cached order byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoDto {
    /// 8-hex-character opaque id.
    pub id: String,
    /// Shell type name.
    pub shell: String,
    /// Current PTY width in columns.
    pub cols: u16,
    /// Current PTY height in rows.
    pub rows: u16,
    /// ttyhost process id.
    pub host_pid: u32,
    /// Whether the shell process is still running.
    pub is_running: bool,
    /// Exit code once the shell has exited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// When the ttyhost created the PTY.
    pub created_at: DateTime<Utc>,
    /// User the shell runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Terminal-reported or manual title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// True when the title was assigned manually.
    #[serde(default)]
    pub has_manual_name: bool,
    /// Foreground process of the PTY, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground: Option<ForegroundProcess>,
    /// The session manager's current display order.
    pub order: u32,
    /// ttyhost binary version string.
    pub version: String,
}

impl SessionInfoDto {
    /// Build the DTO from a cached session and the manager's order view.
    #[must_use]
    pub fn from_session(session: &Session, order: u32) -> Self {
        Self {
            id: session.id.clone(),
            shell: session.shell.clone(),
            cols: session.cols,
            rows: session.rows,
            host_pid: session.host_pid,
            is_running: session.is_running,
            exit_code: session.exit_code,
            created_at: session.created_at,
            user: session.user.clone(),
            title: session.title.clone(),
            has_manual_name: session.has_manual_name,
            foreground: session.foreground.clone(),
            order,
            version: session.version.clone(),
        }
    }
}
