//! Wire protocol codec for mt ↔ ttyhost IPC.
//!
//! Length-prefixed frames with a leading type byte:
//!
//! ```text
//! [u8 type] [i32 LE length] [payload: length bytes]
//! ```
//!
//! `length` is always encoded little-endian regardless of host. A negative
//! length, or one above 1 MiB, means the transport is corrupt and the
//! connection must be closed. A frame is either entirely buffered or
//! entirely absent on the wire; partial frames are a transport error only
//! when the stream ends mid-frame.
//!
//! Unknown frame types are NOT fatal: the decoder logs and skips them so
//! that a newer ttyhost can speak to an older host.

// Rust guideline compliant 2026-02

use anyhow::{anyhow, bail, Result};

use crate::constants::{IPC_HEADER_SIZE, IPC_MAX_PAYLOAD};
use crate::pool::BufferPool;
use crate::session::{ForegroundProcess, Session, StateChange};

/// Frame type byte constants for the IPC wire protocol.
pub mod frame_type {
    /// Request session metadata (mt → host, empty).
    pub const GET_INFO: u8 = 0x01;
    /// Session metadata as UTF-8 JSON (host → mt).
    pub const INFO: u8 = 0x02;
    /// Request the scrollback buffer (mt → host, empty).
    pub const GET_BUFFER: u8 = 0x03;
    /// Raw scrollback bytes (host → mt).
    pub const BUFFER: u8 = 0x04;
    /// Raw keyboard input (mt → host).
    pub const INPUT: u8 = 0x10;
    /// PTY output: `[u16 LE cols][u16 LE rows][bytes]` (host → mt).
    pub const OUTPUT: u8 = 0x11;
    /// Resize: `[i32 LE cols][i32 LE rows]` (mt → host).
    pub const RESIZE: u8 = 0x20;
    /// Resize acknowledgment (host → mt, empty).
    pub const RESIZE_ACK: u8 = 0x21;
    /// Manual session name as UTF-8; empty payload clears it (mt → host).
    pub const SET_NAME: u8 = 0x22;
    /// SetName acknowledgment (host → mt, empty).
    pub const SET_NAME_ACK: u8 = 0x23;
    /// Display-order byte (mt → host).
    pub const SET_ORDER: u8 = 0x24;
    /// SetOrder acknowledgment (host → mt, empty).
    pub const SET_ORDER_ACK: u8 = 0x25;
    /// Close the session (mt → host, empty).
    pub const CLOSE: u8 = 0x30;
    /// Close acknowledgment (host → mt, empty).
    pub const CLOSE_ACK: u8 = 0x31;
    /// Shell state change as JSON `{isRunning, exitCode?}` (host → mt).
    pub const STATE_CHANGE: u8 = 0x40;
    /// Process lifecycle event as JSON (host → mt).
    pub const PROCESS_EVENT: u8 = 0x50;
    /// Foreground process change as JSON (host → mt).
    pub const FOREGROUND_CHANGE: u8 = 0x51;
    /// Snapshot of the PTY process group as JSON (host → mt).
    pub const PROCESS_SNAPSHOT: u8 = 0x52;
    /// Log severity byte (mt → host).
    pub const SET_LOG_LEVEL: u8 = 0x60;
    /// SetLogLevel acknowledgment (host → mt, empty).
    pub const SET_LOG_LEVEL_ACK: u8 = 0x61;
}

/// A decoded IPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcFrame {
    /// Request session metadata.
    GetInfo,
    /// Session metadata.
    Info(Session),
    /// Request the scrollback buffer.
    GetBuffer,
    /// Raw scrollback bytes.
    Buffer(Vec<u8>),
    /// Raw keyboard input.
    Input(Vec<u8>),
    /// PTY output with the dimensions it was produced under.
    Output {
        /// Terminal width in columns.
        cols: u16,
        /// Terminal height in rows.
        rows: u16,
        /// Raw PTY output bytes.
        data: Vec<u8>,
    },
    /// Resize the PTY.
    Resize {
        /// New width in columns.
        cols: i32,
        /// New height in rows.
        rows: i32,
    },
    /// Resize acknowledgment.
    ResizeAck,
    /// Manual session name; `None` clears it.
    SetName(Option<String>),
    /// SetName acknowledgment.
    SetNameAck,
    /// Display-order byte.
    SetOrder(u8),
    /// SetOrder acknowledgment.
    SetOrderAck,
    /// Close the session.
    Close,
    /// Close acknowledgment.
    CloseAck,
    /// Shell state change.
    StateChange(StateChange),
    /// Process lifecycle event (opaque JSON).
    ProcessEvent(serde_json::Value),
    /// Foreground process change.
    ForegroundChange(ForegroundProcess),
    /// Snapshot of the PTY process group (opaque JSON).
    ProcessSnapshot(serde_json::Value),
    /// Log severity byte.
    SetLogLevel(u8),
    /// SetLogLevel acknowledgment.
    SetLogLevelAck,
}

impl IpcFrame {
    /// The wire type byte for this frame.
    #[must_use]
    pub fn frame_type(&self) -> u8 {
        match self {
            IpcFrame::GetInfo => frame_type::GET_INFO,
            IpcFrame::Info(_) => frame_type::INFO,
            IpcFrame::GetBuffer => frame_type::GET_BUFFER,
            IpcFrame::Buffer(_) => frame_type::BUFFER,
            IpcFrame::Input(_) => frame_type::INPUT,
            IpcFrame::Output { .. } => frame_type::OUTPUT,
            IpcFrame::Resize { .. } => frame_type::RESIZE,
            IpcFrame::ResizeAck => frame_type::RESIZE_ACK,
            IpcFrame::SetName(_) => frame_type::SET_NAME,
            IpcFrame::SetNameAck => frame_type::SET_NAME_ACK,
            IpcFrame::SetOrder(_) => frame_type::SET_ORDER,
            IpcFrame::SetOrderAck => frame_type::SET_ORDER_ACK,
            IpcFrame::Close => frame_type::CLOSE,
            IpcFrame::CloseAck => frame_type::CLOSE_ACK,
            IpcFrame::StateChange(_) => frame_type::STATE_CHANGE,
            IpcFrame::ProcessEvent(_) => frame_type::PROCESS_EVENT,
            IpcFrame::ForegroundChange(_) => frame_type::FOREGROUND_CHANGE,
            IpcFrame::ProcessSnapshot(_) => frame_type::PROCESS_SNAPSHOT,
            IpcFrame::SetLogLevel(_) => frame_type::SET_LOG_LEVEL,
            IpcFrame::SetLogLevelAck => frame_type::SET_LOG_LEVEL_ACK,
        }
    }

    /// Encode this frame into a wire-format byte vector.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            IpcFrame::GetInfo
            | IpcFrame::GetBuffer
            | IpcFrame::ResizeAck
            | IpcFrame::SetNameAck
            | IpcFrame::SetOrderAck
            | IpcFrame::Close
            | IpcFrame::CloseAck
            | IpcFrame::SetLogLevelAck => encode(self.frame_type(), &[]),
            IpcFrame::Info(session) => {
                let payload =
                    serde_json::to_vec(session).expect("session serialization cannot fail");
                encode(frame_type::INFO, &payload)
            }
            IpcFrame::Buffer(data) => encode(frame_type::BUFFER, data),
            IpcFrame::Input(data) => encode(frame_type::INPUT, data),
            IpcFrame::Output { cols, rows, data } => encode_output(*cols, *rows, data),
            IpcFrame::Resize { cols, rows } => {
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&cols.to_le_bytes());
                payload.extend_from_slice(&rows.to_le_bytes());
                encode(frame_type::RESIZE, &payload)
            }
            IpcFrame::SetName(name) => {
                encode(frame_type::SET_NAME, name.as_deref().unwrap_or("").as_bytes())
            }
            IpcFrame::SetOrder(order) => encode(frame_type::SET_ORDER, &[*order]),
            IpcFrame::StateChange(change) => {
                let payload =
                    serde_json::to_vec(change).expect("state change serialization cannot fail");
                encode(frame_type::STATE_CHANGE, &payload)
            }
            IpcFrame::ProcessEvent(value) | IpcFrame::ProcessSnapshot(value) => {
                let payload = serde_json::to_vec(value).expect("JSON serialization cannot fail");
                encode(self.frame_type(), &payload)
            }
            IpcFrame::ForegroundChange(fg) => {
                let payload =
                    serde_json::to_vec(fg).expect("foreground serialization cannot fail");
                encode(frame_type::FOREGROUND_CHANGE, &payload)
            }
            IpcFrame::SetLogLevel(level) => encode(frame_type::SET_LOG_LEVEL, &[*level]),
        }
    }
}

/// Encode a raw frame: `[type][i32 LE length][payload]`.
#[must_use]
pub fn encode(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= IPC_MAX_PAYLOAD);
    let mut buf = Vec::with_capacity(IPC_HEADER_SIZE + payload.len());
    buf.push(frame_type);
    buf.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Encode an Output frame without constructing an [`IpcFrame`].
///
/// This is the ttyhost's hot path; the payload layout is
/// `[u16 LE cols][u16 LE rows][bytes]`.
#[must_use]
pub fn encode_output(cols: u16, rows: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(IPC_HEADER_SIZE + 4 + data.len());
    buf.push(frame_type::OUTPUT);
    buf.extend_from_slice(&((4 + data.len()) as i32).to_le_bytes());
    buf.extend_from_slice(&cols.to_le_bytes());
    buf.extend_from_slice(&rows.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Write a frame into a caller-provided buffer.
///
/// The buffer must hold at least `IPC_HEADER_SIZE + payload.len()` bytes;
/// the codec writes the header and copies the payload, never retaining the
/// buffer. Returns the number of bytes written.
pub fn encode_into(buf: &mut [u8], frame_type: u8, payload: &[u8]) -> Result<usize> {
    let total = IPC_HEADER_SIZE + payload.len();
    if payload.len() > IPC_MAX_PAYLOAD {
        bail!("payload too large: {} bytes (max {IPC_MAX_PAYLOAD})", payload.len());
    }
    if buf.len() < total {
        bail!("buffer too small: {} bytes, need {total}", buf.len());
    }
    buf[0] = frame_type;
    buf[1..5].copy_from_slice(&(payload.len() as i32).to_le_bytes());
    buf[IPC_HEADER_SIZE..total].copy_from_slice(payload);
    Ok(total)
}

/// Rent a pooled buffer, encode a frame into it, and hand a view of the
/// completed frame to `visit`.
///
/// The buffer goes back to the pool on every exit path, including when the
/// visitor returns early or errors.
pub fn with_encoded_frame<R>(
    pool: &std::sync::Arc<BufferPool>,
    frame_type: u8,
    payload: &[u8],
    visit: impl FnOnce(&[u8]) -> R,
) -> Result<R> {
    if payload.len() > IPC_MAX_PAYLOAD {
        bail!("payload too large: {} bytes (max {IPC_MAX_PAYLOAD})", payload.len());
    }
    // The PooledBuf guard returns the buffer on every exit path below.
    let mut buf = pool.rent(IPC_HEADER_SIZE + payload.len());
    let written = encode_into(&mut buf, frame_type, payload)?;
    Ok(visit(&buf[..written]))
}

/// Outcome of [`try_read_header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// Fewer than [`IPC_HEADER_SIZE`] bytes are available.
    NeedMore,
    /// A complete header: frame type and payload length.
    Complete {
        /// Frame type byte.
        frame_type: u8,
        /// Announced payload length.
        length: usize,
    },
}

/// Parse a frame header from the front of `bytes` without consuming them.
///
/// # Errors
///
/// Returns an error when the announced length is negative or above the
/// 1 MiB cap; the caller must treat the transport as corrupt. The check
/// happens before any allocation.
pub fn try_read_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < IPC_HEADER_SIZE {
        return Ok(Header::NeedMore);
    }
    let frame_type = bytes[0];
    let length = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    if length < 0 {
        bail!("corrupt frame header: negative length {length}");
    }
    let length = length as usize;
    if length > IPC_MAX_PAYLOAD {
        bail!("corrupt frame header: length {length} exceeds {IPC_MAX_PAYLOAD}");
    }
    Ok(Header::Complete { frame_type, length })
}

/// Decode a single frame's payload by type.
///
/// Unknown types return `Ok(None)`; the caller logs and drops them.
///
/// # Errors
///
/// Returns an error for a known type whose payload does not parse; the
/// connection must then be closed.
pub fn decode_payload(frame_type: u8, payload: &[u8]) -> Result<Option<IpcFrame>> {
    let frame = match frame_type {
        frame_type::GET_INFO => IpcFrame::GetInfo,
        frame_type::INFO => {
            let session: Session = serde_json::from_slice(payload)
                .map_err(|e| anyhow!("invalid Info JSON: {e}"))?;
            IpcFrame::Info(session)
        }
        frame_type::GET_BUFFER => IpcFrame::GetBuffer,
        frame_type::BUFFER => IpcFrame::Buffer(payload.to_vec()),
        frame_type::INPUT => IpcFrame::Input(payload.to_vec()),
        frame_type::OUTPUT => {
            if payload.len() < 4 {
                bail!("Output frame too short: {} bytes", payload.len());
            }
            IpcFrame::Output {
                cols: u16::from_le_bytes([payload[0], payload[1]]),
                rows: u16::from_le_bytes([payload[2], payload[3]]),
                data: payload[4..].to_vec(),
            }
        }
        frame_type::RESIZE => {
            if payload.len() < 8 {
                bail!("Resize frame too short: {} bytes", payload.len());
            }
            IpcFrame::Resize {
                cols: i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
                rows: i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]),
            }
        }
        frame_type::RESIZE_ACK => IpcFrame::ResizeAck,
        frame_type::SET_NAME => {
            let name = std::str::from_utf8(payload)
                .map_err(|e| anyhow!("SetName payload is not UTF-8: {e}"))?;
            IpcFrame::SetName(if name.is_empty() { None } else { Some(name.to_owned()) })
        }
        frame_type::SET_NAME_ACK => IpcFrame::SetNameAck,
        frame_type::SET_ORDER => {
            if payload.len() != 1 {
                bail!("SetOrder payload must be one byte, got {}", payload.len());
            }
            IpcFrame::SetOrder(payload[0])
        }
        frame_type::SET_ORDER_ACK => IpcFrame::SetOrderAck,
        frame_type::CLOSE => IpcFrame::Close,
        frame_type::CLOSE_ACK => IpcFrame::CloseAck,
        frame_type::STATE_CHANGE => {
            let change: StateChange = serde_json::from_slice(payload)
                .map_err(|e| anyhow!("invalid StateChange JSON: {e}"))?;
            IpcFrame::StateChange(change)
        }
        frame_type::PROCESS_EVENT => {
            let value: serde_json::Value = serde_json::from_slice(payload)
                .map_err(|e| anyhow!("invalid ProcessEvent JSON: {e}"))?;
            IpcFrame::ProcessEvent(value)
        }
        frame_type::FOREGROUND_CHANGE => {
            let fg: ForegroundProcess = serde_json::from_slice(payload)
                .map_err(|e| anyhow!("invalid ForegroundChange JSON: {e}"))?;
            IpcFrame::ForegroundChange(fg)
        }
        frame_type::PROCESS_SNAPSHOT => {
            let value: serde_json::Value = serde_json::from_slice(payload)
                .map_err(|e| anyhow!("invalid ProcessSnapshot JSON: {e}"))?;
            IpcFrame::ProcessSnapshot(value)
        }
        frame_type::SET_LOG_LEVEL => {
            if payload.len() != 1 {
                bail!("SetLogLevel payload must be one byte, got {}", payload.len());
            }
            IpcFrame::SetLogLevel(payload[0])
        }
        frame_type::SET_LOG_LEVEL_ACK => IpcFrame::SetLogLevelAck,
        other => {
            log::warn!("[ipc] dropping frame with unknown type 0x{other:02x} ({} payload bytes)", payload.len());
            return Ok(None);
        }
    };
    Ok(Some(frame))
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
/// Incomplete data is buffered for the next call; unknown frame types are
/// skipped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// # Errors
    ///
    /// Returns an error when a header is corrupt or a known frame's payload
    /// does not parse. The transport must then be closed; the decoder is no
    /// longer usable.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<IpcFrame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            let (frame_type, length) = match try_read_header(&self.buf)? {
                Header::NeedMore => break,
                Header::Complete { frame_type, length } => (frame_type, length),
            };

            let total = IPC_HEADER_SIZE + length;
            if self.buf.len() < total {
                break; // incomplete frame, wait for more data
            }

            let payload = &self.buf[IPC_HEADER_SIZE..total];
            if let Some(frame) = decode_payload(frame_type, payload)? {
                frames.push(frame);
            }
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// True if the decoder has buffered partial data.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_session() -> Session {
        Session {
            id: "abcd1234".into(),
            shell: "bash".into(),
            cols: 80,
            rows: 24,
            host_pid: 100,
            is_running: true,
            exit_code: None,
            created_at: Utc::now(),
            user: None,
            title: None,
            has_manual_name: false,
            foreground: None,
            order: 0,
            version: "0.5.1".into(),
        }
    }

    #[test]
    fn test_header_layout_is_type_then_le_length() {
        let encoded = encode(frame_type::INPUT, b"hi");
        assert_eq!(encoded[0], frame_type::INPUT);
        assert_eq!(&encoded[1..5], &2i32.to_le_bytes());
        assert_eq!(&encoded[5..], b"hi");
    }

    #[test]
    fn test_round_trip_every_empty_frame() {
        for frame in [
            IpcFrame::GetInfo,
            IpcFrame::GetBuffer,
            IpcFrame::ResizeAck,
            IpcFrame::SetNameAck,
            IpcFrame::SetOrderAck,
            IpcFrame::Close,
            IpcFrame::CloseAck,
            IpcFrame::SetLogLevelAck,
        ] {
            let mut dec = FrameDecoder::new();
            let frames = dec.feed(&frame.encode()).unwrap();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0], frame);
            assert!(!dec.has_partial());
        }
    }

    #[test]
    fn test_output_round_trip() {
        let frame = IpcFrame::Output { cols: 120, rows: 40, data: b"hello world".to_vec() };
        let frames = FrameDecoder::new().feed(&frame.encode()).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_encode_output_matches_enum_encoding() {
        let fast = encode_output(120, 40, b"x");
        let slow = IpcFrame::Output { cols: 120, rows: 40, data: b"x".to_vec() }.encode();
        assert_eq!(fast, slow);
    }

    #[test]
    fn test_resize_uses_i32_fields() {
        let frame = IpcFrame::Resize { cols: 200, rows: 50 };
        let encoded = frame.encode();
        assert_eq!(&encoded[5..9], &200i32.to_le_bytes());
        assert_eq!(&encoded[9..13], &50i32.to_le_bytes());
        let frames = FrameDecoder::new().feed(&encoded).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_info_round_trip() {
        let frame = IpcFrame::Info(sample_session());
        let frames = FrameDecoder::new().feed(&frame.encode()).unwrap();
        assert_eq!(frames.len(), 1);
        if let IpcFrame::Info(session) = &frames[0] {
            assert_eq!(session.id, "abcd1234");
            assert_eq!(session.shell, "bash");
        } else {
            panic!("expected Info");
        }
    }

    #[test]
    fn test_set_name_empty_payload_means_clear() {
        let set = IpcFrame::SetName(Some("build".into()));
        let frames = FrameDecoder::new().feed(&set.encode()).unwrap();
        assert_eq!(frames, vec![set]);

        let clear = IpcFrame::SetName(None);
        let frames = FrameDecoder::new().feed(&clear.encode()).unwrap();
        assert_eq!(frames, vec![IpcFrame::SetName(None)]);
    }

    #[test]
    fn test_state_change_round_trip() {
        let frame = IpcFrame::StateChange(StateChange { is_running: false, exit_code: Some(1) });
        let frames = FrameDecoder::new().feed(&frame.encode()).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_foreground_change_round_trip() {
        let frame = IpcFrame::ForegroundChange(ForegroundProcess {
            pid: 42,
            name: "vim".into(),
            command_line: None,
            cwd: Some("/tmp".into()),
        });
        let frames = FrameDecoder::new().feed(&frame.encode()).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_payload_round_trip_up_to_cap() {
        // decode(encode(type, b)) == (type, b) for payloads up to 1 MiB.
        for len in [0usize, 1, 1024, IPC_MAX_PAYLOAD] {
            let data = vec![0x5Au8; len];
            let frames = FrameDecoder::new()
                .feed(&encode(frame_type::BUFFER, &data))
                .unwrap();
            assert_eq!(frames, vec![IpcFrame::Buffer(data)]);
        }
    }

    #[test]
    fn test_try_read_header_needs_five_bytes() {
        for len in 0..IPC_HEADER_SIZE {
            let bytes = vec![0u8; len];
            assert_eq!(try_read_header(&bytes).unwrap(), Header::NeedMore);
        }
    }

    #[test]
    fn test_negative_length_is_corrupt() {
        let mut bytes = vec![frame_type::INPUT];
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        assert!(try_read_header(&bytes).is_err());
        assert!(FrameDecoder::new().feed(&bytes).is_err());
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let mut bytes = vec![frame_type::INPUT];
        bytes.extend_from_slice(&((IPC_MAX_PAYLOAD as i32) + 1).to_le_bytes());
        let mut dec = FrameDecoder::new();
        assert!(dec.feed(&bytes).is_err());
    }

    #[test]
    fn test_unknown_type_is_skipped_not_fatal() {
        let mut bytes = encode(0x7F, b"future frame");
        bytes.extend_from_slice(&encode(frame_type::INPUT, b"ok"));
        let frames = FrameDecoder::new().feed(&bytes).unwrap();
        assert_eq!(frames, vec![IpcFrame::Input(b"ok".to_vec())]);
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let encoded = IpcFrame::Input(b"split me".to_vec()).encode();
        let mid = encoded.len() / 2;
        let mut dec = FrameDecoder::new();
        assert!(dec.feed(&encoded[..mid]).unwrap().is_empty());
        assert!(dec.has_partial());
        let frames = dec.feed(&encoded[mid..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!dec.has_partial());
    }

    #[test]
    fn test_byte_at_a_time() {
        let encoded = IpcFrame::SetOrder(7).encode();
        let mut dec = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &encoded {
            frames.extend(dec.feed(&[*byte]).unwrap());
        }
        assert_eq!(frames, vec![IpcFrame::SetOrder(7)]);
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let mut bytes = IpcFrame::GetInfo.encode();
        bytes.extend_from_slice(&IpcFrame::Input(b"ls\n".to_vec()).encode());
        bytes.extend_from_slice(&IpcFrame::CloseAck.encode());
        let frames = FrameDecoder::new().feed(&bytes).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], IpcFrame::GetInfo);
        assert_eq!(frames[2], IpcFrame::CloseAck);
    }

    #[test]
    fn test_encode_into_writes_exact_bytes() {
        let mut buf = [0u8; 64];
        let n = encode_into(&mut buf, frame_type::INPUT, b"abc").unwrap();
        assert_eq!(n, IPC_HEADER_SIZE + 3);
        assert_eq!(&buf[..n], encode(frame_type::INPUT, b"abc").as_slice());
    }

    #[test]
    fn test_encode_into_rejects_small_buffer() {
        let mut buf = [0u8; 4];
        assert!(encode_into(&mut buf, frame_type::INPUT, b"abc").is_err());
    }

    #[test]
    fn test_with_encoded_frame_returns_buffer_on_all_paths() {
        let pool = BufferPool::new();
        let decoded = with_encoded_frame(&pool, frame_type::INPUT, b"pooled", |view| {
            FrameDecoder::new().feed(view).unwrap()
        })
        .unwrap();
        assert_eq!(decoded, vec![IpcFrame::Input(b"pooled".to_vec())]);
        assert_eq!(pool.outstanding(), 0);

        // Error path (payload too large) must not leak either.
        let huge = vec![0u8; IPC_MAX_PAYLOAD + 1];
        assert!(with_encoded_frame(&pool, frame_type::INPUT, &huge, |_| ()).is_err());
        assert_eq!(pool.outstanding(), 0);
    }
}
