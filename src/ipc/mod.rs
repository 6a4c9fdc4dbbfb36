//! IPC between the mt host and each ttyhost subprocess.
//!
//! The transport is a per-session UNIX domain socket in a 0700 per-user
//! directory; the wire format is the length-prefixed binary frame defined
//! in [`framing`]. Endpoint naming and enumeration live in [`endpoint`].

pub mod endpoint;
pub mod framing;
