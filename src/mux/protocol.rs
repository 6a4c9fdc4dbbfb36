//! Browser-facing binary frame format and payload compression.
//!
//! Every frame starts with a 9-byte header:
//!
//! ```text
//! [u8 type] [sessionId: 8 ASCII bytes]
//! ```
//!
//! Output bodies carry the dimensions the bytes were produced under so the
//! browser can lay out scrollback correctly even across resizes. Large
//! chunks are DEFLATE-compressed; the uncompressed length travels out of
//! band in the CompressedOutput body so the browser can pre-size its
//! buffer. The init frame (type 0xFF) is the first frame on every
//! connection and pins the protocol version plus the server-assigned
//! client id.

// Rust guideline compliant 2026-02

use std::io::{Read, Write};

use anyhow::{anyhow, bail, Result};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::constants::{
    CLIENT_ID_LEN, COMPRESSION_THRESHOLD, MUX_HEADER_SIZE, PROTOCOL_VERSION, REPLAY_CHUNK_SIZE,
};

/// Fixed DEFLATE quality; both ends must agree on the codec, not the level.
const DEFLATE_LEVEL: u32 = 6;

/// Frame type byte constants for the browser wire protocol.
pub mod frame_type {
    /// PTY output: `[u16 LE cols][u16 LE rows][data]` (server → browser).
    pub const OUTPUT: u8 = 0x01;
    /// Compressed output: `[u16 LE cols][u16 LE rows][u32 LE uncompressedLen][deflate]`.
    pub const COMPRESSED_OUTPUT: u8 = 0x02;
    /// Raw keyboard input (browser → server).
    pub const TERMINAL_INPUT: u8 = 0x10;
    /// Resize: `[u16 LE cols][u16 LE rows]` (browser → server).
    pub const RESIZE: u8 = 0x11;
    /// Request a scrollback replay (browser → server, empty body).
    pub const BUFFER_REQUEST: u8 = 0x12;
    /// The user focused this session (browser → server, empty body).
    pub const ACTIVE_SESSION_HINT: u8 = 0x13;
    /// Drop all local state for the session and await a replay.
    pub const CLEAR_SCREEN: u8 = 0x20;
    /// Bytes were dropped before this flush: `[u32 LE droppedBytes]`.
    pub const DATA_LOSS: u8 = 0x21;
    /// Foreground process change as UTF-8 JSON (server → browser).
    pub const FOREGROUND_CHANGE: u8 = 0x51;
    /// First frame on a connection: `[u16 LE protocolVersion][32-byte clientId]`.
    pub const INIT: u8 = 0xFF;
}

/// The session-id header field: first 8 ASCII bytes, zero-padded.
#[must_use]
pub fn session_id_field(session_id: &str) -> [u8; 8] {
    let mut field = [0u8; 8];
    let bytes = session_id.as_bytes();
    let n = bytes.len().min(8);
    field[..n].copy_from_slice(&bytes[..n]);
    field
}

fn header(frame_type: u8, session_id: &str, body_len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MUX_HEADER_SIZE + body_len);
    buf.push(frame_type);
    buf.extend_from_slice(&session_id_field(session_id));
    buf
}

/// Encode an uncompressed Output frame.
#[must_use]
pub fn encode_output(session_id: &str, cols: u16, rows: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = header(frame_type::OUTPUT, session_id, 4 + data.len());
    buf.extend_from_slice(&cols.to_le_bytes());
    buf.extend_from_slice(&rows.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Encode a CompressedOutput frame from already-compressed data.
#[must_use]
pub fn encode_compressed_output(
    session_id: &str,
    cols: u16,
    rows: u16,
    uncompressed_len: u32,
    compressed: &[u8],
) -> Vec<u8> {
    let mut buf = header(frame_type::COMPRESSED_OUTPUT, session_id, 8 + compressed.len());
    buf.extend_from_slice(&cols.to_le_bytes());
    buf.extend_from_slice(&rows.to_le_bytes());
    buf.extend_from_slice(&uncompressed_len.to_le_bytes());
    buf.extend_from_slice(compressed);
    buf
}

/// Encode one output chunk, compressing when it exceeds the threshold.
#[must_use]
pub fn encode_output_auto(session_id: &str, cols: u16, rows: u16, data: &[u8]) -> Vec<u8> {
    if data.len() > COMPRESSION_THRESHOLD {
        let compressed = compress(data);
        encode_compressed_output(session_id, cols, rows, data.len() as u32, &compressed)
    } else {
        encode_output(session_id, cols, rows, data)
    }
}

/// Encode a scrollback replay as 64 KiB chunks, each compressed when large
/// enough.
#[must_use]
pub fn encode_replay_chunks(session_id: &str, cols: u16, rows: u16, data: &[u8]) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return Vec::new();
    }
    data.chunks(REPLAY_CHUNK_SIZE)
        .map(|chunk| encode_output_auto(session_id, cols, rows, chunk))
        .collect()
}

/// Encode a ClearScreen frame.
#[must_use]
pub fn encode_clear_screen(session_id: &str) -> Vec<u8> {
    header(frame_type::CLEAR_SCREEN, session_id, 0)
}

/// Encode a DataLoss frame with the exact dropped-byte count.
#[must_use]
pub fn encode_data_loss(session_id: &str, dropped_bytes: u32) -> Vec<u8> {
    let mut buf = header(frame_type::DATA_LOSS, session_id, 4);
    buf.extend_from_slice(&dropped_bytes.to_le_bytes());
    buf
}

/// Encode a ForegroundChange frame from pre-serialized JSON.
#[must_use]
pub fn encode_foreground_change(session_id: &str, json: &[u8]) -> Vec<u8> {
    let mut buf = header(frame_type::FOREGROUND_CHANGE, session_id, json.len());
    buf.extend_from_slice(json);
    buf
}

/// Encode the init frame.
///
/// The 8-byte id field carries the short form of the client id for quick
/// diagnostic matching; the body has the protocol version and the full
/// 32-byte id.
#[must_use]
pub fn encode_init(client_id: &str) -> Vec<u8> {
    debug_assert_eq!(client_id.len(), CLIENT_ID_LEN);
    let mut buf = header(frame_type::INIT, client_id, 2 + CLIENT_ID_LEN);
    buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    let mut id = [0u8; CLIENT_ID_LEN];
    let bytes = client_id.as_bytes();
    let n = bytes.len().min(CLIENT_ID_LEN);
    id[..n].copy_from_slice(&bytes[..n]);
    buf.extend_from_slice(&id);
    buf
}

/// A frame received from the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Raw keyboard input for a session.
    TerminalInput {
        /// Target session.
        session_id: String,
        /// Raw input bytes.
        data: Vec<u8>,
    },
    /// Resize a session's PTY.
    Resize {
        /// Target session.
        session_id: String,
        /// New width in columns.
        cols: u16,
        /// New height in rows.
        rows: u16,
    },
    /// Re-send the session's scrollback.
    BufferRequest {
        /// Target session.
        session_id: String,
    },
    /// The user focused this session.
    ActiveSessionHint {
        /// Newly active session.
        session_id: String,
    },
    /// Unrecognized frame type; logged and ignored.
    Unknown {
        /// The unrecognized type byte.
        frame_type: u8,
    },
}

/// Decode a frame received from the browser.
///
/// # Errors
///
/// Returns an error when the frame is shorter than its type requires; the
/// caller logs it and continues.
pub fn decode_inbound(bytes: &[u8]) -> Result<InboundFrame> {
    if bytes.len() < MUX_HEADER_SIZE {
        bail!("mux frame too short: {} bytes", bytes.len());
    }
    let frame_type = bytes[0];
    let session_id = decode_session_id(&bytes[1..9]);
    let body = &bytes[MUX_HEADER_SIZE..];

    let frame = match frame_type {
        frame_type::TERMINAL_INPUT => InboundFrame::TerminalInput {
            session_id,
            data: body.to_vec(),
        },
        frame_type::RESIZE => {
            if body.len() < 4 {
                bail!("Resize body too short: {} bytes", body.len());
            }
            InboundFrame::Resize {
                session_id,
                cols: u16::from_le_bytes([body[0], body[1]]),
                rows: u16::from_le_bytes([body[2], body[3]]),
            }
        }
        frame_type::BUFFER_REQUEST => InboundFrame::BufferRequest { session_id },
        frame_type::ACTIVE_SESSION_HINT => InboundFrame::ActiveSessionHint { session_id },
        other => InboundFrame::Unknown { frame_type: other },
    };
    Ok(frame)
}

fn decode_session_id(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// An outbound frame decoded back from wire bytes (used by clients and the
/// end-to-end tests; the server only encodes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Plain output.
    Output {
        /// Originating session.
        session_id: String,
        /// Width the output was produced under.
        cols: u16,
        /// Height the output was produced under.
        rows: u16,
        /// Raw bytes.
        data: Vec<u8>,
    },
    /// Output that was compressed on the wire (returned decompressed).
    CompressedOutput {
        /// Originating session.
        session_id: String,
        /// Width the output was produced under.
        cols: u16,
        /// Height the output was produced under.
        rows: u16,
        /// Decompressed bytes.
        data: Vec<u8>,
    },
    /// Drop local state for the session.
    ClearScreen {
        /// Target session.
        session_id: String,
    },
    /// Bytes were dropped before the following output.
    DataLoss {
        /// Target session.
        session_id: String,
        /// Exact number of dropped bytes.
        dropped_bytes: u32,
    },
    /// Foreground process change (raw JSON).
    ForegroundChange {
        /// Target session.
        session_id: String,
        /// UTF-8 JSON payload.
        json: Vec<u8>,
    },
    /// Connection init.
    Init {
        /// Short id field (first 8 bytes of the client id).
        short_id: String,
        /// Protocol version.
        protocol_version: u16,
        /// Full client id.
        client_id: String,
    },
}

/// Decode a server→browser frame.
///
/// # Errors
///
/// Returns an error on truncated bodies, unknown types, or compressed
/// payloads that fail to inflate to the announced length.
pub fn decode_outbound(bytes: &[u8]) -> Result<OutboundFrame> {
    if bytes.len() < MUX_HEADER_SIZE {
        bail!("mux frame too short: {} bytes", bytes.len());
    }
    let frame_type = bytes[0];
    let session_id = decode_session_id(&bytes[1..9]);
    let body = &bytes[MUX_HEADER_SIZE..];

    let frame = match frame_type {
        frame_type::OUTPUT => {
            if body.len() < 4 {
                bail!("Output body too short");
            }
            OutboundFrame::Output {
                session_id,
                cols: u16::from_le_bytes([body[0], body[1]]),
                rows: u16::from_le_bytes([body[2], body[3]]),
                data: body[4..].to_vec(),
            }
        }
        frame_type::COMPRESSED_OUTPUT => {
            if body.len() < 8 {
                bail!("CompressedOutput body too short");
            }
            let uncompressed_len = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
            let data = decompress(&body[8..], uncompressed_len as usize)?;
            OutboundFrame::CompressedOutput {
                session_id,
                cols: u16::from_le_bytes([body[0], body[1]]),
                rows: u16::from_le_bytes([body[2], body[3]]),
                data,
            }
        }
        frame_type::CLEAR_SCREEN => OutboundFrame::ClearScreen { session_id },
        frame_type::DATA_LOSS => {
            if body.len() < 4 {
                bail!("DataLoss body too short");
            }
            OutboundFrame::DataLoss {
                session_id,
                dropped_bytes: u32::from_le_bytes([body[0], body[1], body[2], body[3]]),
            }
        }
        frame_type::FOREGROUND_CHANGE => OutboundFrame::ForegroundChange {
            session_id,
            json: body.to_vec(),
        },
        frame_type::INIT => {
            if body.len() < 2 + CLIENT_ID_LEN {
                bail!("Init body too short: {} bytes", body.len());
            }
            OutboundFrame::Init {
                short_id: session_id,
                protocol_version: u16::from_le_bytes([body[0], body[1]]),
                client_id: String::from_utf8_lossy(&body[2..2 + CLIENT_ID_LEN]).into_owned(),
            }
        }
        other => bail!("unknown outbound mux frame type 0x{other:02x}"),
    };
    Ok(frame)
}

/// DEFLATE-compress a chunk at the fixed level.
#[must_use]
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(data.len() / 2),
        Compression::new(DEFLATE_LEVEL),
    );
    // Writing into a Vec cannot fail.
    encoder.write_all(data).expect("deflate into Vec cannot fail");
    encoder.finish().expect("deflate finish into Vec cannot fail")
}

/// Inflate a chunk and verify it matches the announced length.
pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(expected_len);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| anyhow!("deflate decompress failed: {e}"))?;
    if out.len() != expected_len {
        bail!("decompressed length {} does not match announced {expected_len}", out.len());
    }
    Ok(out)
}
