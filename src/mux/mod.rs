//! Browser-facing multiplexing: per-client pipelines over one WebSocket.
//!
//! The [`manager::MuxConnectionManager`] fans ttyhost output out to every
//! connected browser; each [`client::MuxClient`] stages output in
//! per-session ring buffers and flushes with active-session priority so a
//! slow background session can never starve the one the user is watching.

pub mod client;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod ring_buffer;
