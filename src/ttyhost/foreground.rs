//! Foreground-process tracking for the ttyhost.
//!
//! Polls the PTY's foreground process group and reports changes to mt as
//! ForegroundChange frames (plus a ProcessSnapshot of the group). Process
//! details come from /proc on Linux; other platforms report the pid with
//! the shell name only.

// Rust guideline compliant 2026-01

use crate::session::ForegroundProcess;

/// Describe a pid for the foreground descriptor.
#[must_use]
pub fn describe_process(pid: u32) -> ForegroundProcess {
    #[cfg(target_os = "linux")]
    {
        let name = std::fs::read_to_string(format!("/proc/{pid}/comm"))
            .map(|s| s.trim().to_owned())
            .unwrap_or_else(|_| format!("pid-{pid}"));
        let command_line = std::fs::read(format!("/proc/{pid}/cmdline"))
            .ok()
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                raw.split(|&b| b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            });
        let cwd = std::fs::read_link(format!("/proc/{pid}/cwd"))
            .ok()
            .map(|p| p.to_string_lossy().into_owned());
        ForegroundProcess { pid, name, command_line, cwd }
    }

    #[cfg(not(target_os = "linux"))]
    {
        ForegroundProcess {
            pid,
            name: format!("pid-{pid}"),
            command_line: None,
            cwd: None,
        }
    }
}

/// Build the ProcessSnapshot payload for the current foreground group.
///
/// The shape is a JSON array of process descriptors; mt treats it as
/// opaque (the frontend rendering lives elsewhere).
#[must_use]
pub fn snapshot_payload(foreground: &ForegroundProcess) -> serde_json::Value {
    serde_json::json!([foreground])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_self() {
        let me = describe_process(std::process::id());
        assert_eq!(me.pid, std::process::id());
        assert!(!me.name.is_empty());
        #[cfg(target_os = "linux")]
        {
            assert!(me.command_line.is_some());
            assert!(me.cwd.is_some());
        }
    }

    #[test]
    fn test_describe_bogus_pid_still_yields_descriptor() {
        let fg = describe_process(0x3FFF_FFF0);
        assert_eq!(fg.pid, 0x3FFF_FFF0);
        assert!(!fg.name.is_empty());
    }

    #[test]
    fn test_snapshot_is_array_of_descriptors() {
        let fg = describe_process(std::process::id());
        let snapshot = snapshot_payload(&fg);
        assert!(snapshot.is_array());
        assert_eq!(snapshot[0]["pid"], std::process::id());
    }
}
