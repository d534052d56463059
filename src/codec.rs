// src/codec.rs

//! Length-delimited typed-message framing for the control protocols.
//!
//! One call writes or reads exactly one complete message. Each frame is:
//!
//! ```text
//! +--------------------------+
//! | Payload length (4 bytes) |  <- u32 little-endian
//! +--------------------------+
//! | Message kind (4 bytes)   |  <- u32 little-endian
//! +--------------------------+
//! | Payload (bincode)        |
//! +--------------------------+
//! ```
//!
//! The kind tag lets a reader detect that the peer sent a message of an
//! unexpected type, which is reported as a desync error rather than decoded
//! into garbage. A clean end-of-stream before any header byte is a normal
//! outcome (`Ok(None)`); end-of-stream mid-frame is a desync error.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::remote::OpenMode;

/// Frame header: payload length + message kind.
pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a single control payload. Control messages are tiny; a
/// larger length means the stream is desynchronized.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024;

/// Open reply code for success.
pub const REPLY_OK: u32 = 0;

/// Open reply code for "image does not exist" (read-path-significant).
pub const REPLY_NOT_FOUND: u32 = 2;

/// Wire tag of each control message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    ImageOpen = 1,
    ImageOpenReply = 2,
    SnapshotId = 3,
    StreamerRequest = 4,
    StreamerReply = 5,
}

/// A control message with a fixed wire tag.
pub trait Message: Serialize + DeserializeOwned {
    const KIND: MessageKind;
}

/// Request to open a named, generation-tagged image.
///
/// `snapshot_id` is `None` for control requests that are not generation
/// scoped (the finish handshake and the hierarchy transfer itself).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOpenRequest {
    pub name: String,
    pub snapshot_id: Option<String>,
    pub mode: OpenMode,
}

impl Message for ImageOpenRequest {
    const KIND: MessageKind = MessageKind::ImageOpen;
}

/// Reply to an [`ImageOpenRequest`] on the read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOpenReply {
    pub error: u32,
}

impl Message for ImageOpenReply {
    const KIND: MessageKind = MessageKind::ImageOpenReply;
}

/// One entry of the snapshot-id hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotIdEntry {
    pub snapshot_id: String,
}

impl Message for SnapshotIdEntry {
    const KIND: MessageKind = MessageKind::SnapshotId;
}

/// Request for a named file over the streamer control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerRequest {
    pub filename: String,
}

impl Message for StreamerRequest {
    const KIND: MessageKind = MessageKind::StreamerRequest;
}

/// Streamer existence reply, sent in serve mode only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerReply {
    pub exists: bool,
}

impl Message for StreamerReply {
    const KIND: MessageKind = MessageKind::StreamerReply;
}

/// Writes one complete message to `writer`.
pub fn write_message<M: Message, W: Write>(writer: &mut W, msg: &M) -> Result<()> {
    let payload = bincode::serialize(msg)
        .map_err(|e| TransportError::codec(format!("failed to encode message: {e}")))?;
    if payload.len() > MAX_PAYLOAD_LEN as usize {
        return Err(TransportError::codec(format!(
            "message payload too large ({} bytes)",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(M::KIND as u32).to_le_bytes());
    frame.extend_from_slice(&payload);

    writer
        .write_all(&frame)
        .map_err(|e| TransportError::transport("failed to send control message", e))?;
    writer
        .flush()
        .map_err(|e| TransportError::transport("failed to flush control message", e))?;
    Ok(())
}

/// Reads one complete message of type `M` from `reader`.
///
/// Returns `Ok(None)` on a clean end-of-stream (the peer closed before any
/// byte of the next frame). A message of a different kind, an oversized
/// length, or end-of-stream inside a frame are all desync errors.
pub fn read_message<M: Message, R: Read>(reader: &mut R) -> Result<Option<M>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    if !read_header(reader, &mut header)? {
        return Ok(None);
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let kind = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if kind != M::KIND as u32 {
        return Err(TransportError::desync(format!(
            "expected message kind {:?}, peer sent kind {kind}",
            M::KIND
        )));
    }
    if len > MAX_PAYLOAD_LEN {
        return Err(TransportError::desync(format!(
            "message length {len} exceeds limit"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::desync("end of stream inside a message payload")
        } else {
            TransportError::transport("failed to receive control message", e)
        }
    })?;

    let msg = bincode::deserialize(&payload)
        .map_err(|e| TransportError::codec(format!("failed to decode message: {e}")))?;
    Ok(Some(msg))
}

/// Fills `header`, distinguishing clean EOF (no bytes at all, returns
/// `false`) from EOF partway through the header (desync).
fn read_header<R: Read>(reader: &mut R, header: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(TransportError::desync(
                    "end of stream inside a message header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(TransportError::transport(
                    "failed to receive control message header",
                    e,
                ))
            }
        }
    }
    Ok(true)
}
