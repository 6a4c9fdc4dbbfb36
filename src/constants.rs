//! Application-wide constants for MidTerm.
//!
//! This module centralizes all magic numbers and configuration constants
//! to improve maintainability and discoverability. Constants are grouped
//! by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Wire limits**: frame and payload size caps
//! - **Buffering**: ring buffer and queue capacities, flush thresholds
//! - **Timeouts**: connect, request, discovery and shutdown windows
//! - **Sessions**: registry limits

use std::time::Duration;

// ============================================================================
// Wire limits
// ============================================================================

/// Maximum IPC frame payload size (1 MiB).
///
/// A header announcing a larger (or negative) length means the transport
/// is corrupt and the connection is closed without retry.
pub const IPC_MAX_PAYLOAD: usize = 1024 * 1024;

/// IPC frame header size: `[type:u8][length:i32 LE]`.
pub const IPC_HEADER_SIZE: usize = 5;

/// Mux frame header size: `[type:u8][sessionId:8 ASCII]`.
pub const MUX_HEADER_SIZE: usize = 9;

/// Browser mux protocol version carried in the init frame.
pub const PROTOCOL_VERSION: u16 = 1;

/// Length of the full client id carried in the init frame body.
pub const CLIENT_ID_LEN: usize = 32;

/// Custom WebSocket close code sent when the host is shutting down.
///
/// Browsers treat it as a normal closure for reconnection purposes.
pub const SERVER_SHUTDOWN_CLOSE_CODE: u16 = 4002;

// ============================================================================
// Buffering
// ============================================================================

/// Per-session ring buffer capacity inside each mux client (256 KiB).
pub const RING_CAPACITY: usize = 256 * 1024;

/// Capacity of the global fan-out queue and each client's inbound queue.
///
/// Overflow drops the oldest item and bumps the client's dropped-frame
/// counter, which eventually triggers a full buffer resync.
pub const OUTPUT_QUEUE_CAPACITY: usize = 1000;

/// Minimum chunk size before output is DEFLATE-compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Scrollback replays are chunked at this boundary before compression.
pub const REPLAY_CHUNK_SIZE: usize = 64 * 1024;

/// ttyhost-side scrollback ring capacity (1 MiB).
pub const SCROLLBACK_CAPACITY: usize = 1024 * 1024;

// ============================================================================
// Flush policy
// ============================================================================

/// Background sessions are flushed at least this often.
pub const BACKGROUND_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// The mux client process loop wakes at least this often even when idle.
pub const PROCESS_LOOP_TICK: Duration = Duration::from_secs(1);

// ============================================================================
// Sessions
// ============================================================================

/// Hard cap on concurrently live sessions.
pub const MAX_SESSIONS: usize = 256;

/// Oldest ttyhost version the host will adopt during discovery.
///
/// Orphans below this are killed and their endpoints removed.
pub const MIN_COMPATIBLE_PTY_VERSION: &str = "0.5.0";

// ============================================================================
// Timeouts
// ============================================================================

/// Normal request/ack window on a ttyhost connection.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-candidate connect window during startup discovery.
pub const DISCOVERY_CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Per-candidate GetInfo window during startup discovery.
pub const DISCOVERY_INFO_TIMEOUT: Duration = Duration::from_millis(1500);

/// How long a Close waits for its CloseAck during host shutdown.
pub const SHUTDOWN_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connect attempts after spawning a ttyhost, and their spacing.
pub const CONNECT_ATTEMPTS: usize = 10;

/// Delay between post-spawn connect attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// First delay while waiting for a spawned ttyhost's endpoint to appear.
///
/// Doubles on each retry up to [`ENDPOINT_WAIT_MAX`].
pub const ENDPOINT_WAIT_INITIAL: Duration = Duration::from_millis(50);

/// Backoff ceiling while waiting for a spawned ttyhost's endpoint.
pub const ENDPOINT_WAIT_MAX: Duration = Duration::from_millis(500);

/// Overall window for the endpoint-existence wait.
pub const ENDPOINT_WAIT_TOTAL: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_are_consistent() {
        // A single ring flush must fit in one IPC-sized chunk after splitting.
        assert!(REPLAY_CHUNK_SIZE <= IPC_MAX_PAYLOAD);
        assert!(COMPRESSION_THRESHOLD < RING_CAPACITY);
        assert!(RING_CAPACITY <= SCROLLBACK_CAPACITY);
    }

    #[test]
    fn test_timeout_values_are_reasonable() {
        assert!(REQUEST_TIMEOUT >= Duration::from_secs(1));
        assert!(DISCOVERY_CONNECT_TIMEOUT < REQUEST_TIMEOUT);
        assert!(SHUTDOWN_CLOSE_TIMEOUT <= REQUEST_TIMEOUT);
    }
}
