//! Wire framing and payload codec.
//!
//! Every message on a control or data socket is one frame:
//!
//! ```text
//! [length:4 big-endian][payload:N]
//! ```
//!
//! The payload is a self-describing tagged encoding (serde-derived JSON) of
//! one protocol packet. Both ends of a connection always speak the same
//! encoding; there is no negotiation.
//!
//! Framing errors are never recoverable on a live socket: once a length
//! prefix cannot be trusted the stream is desynchronized, so callers MUST
//! close the connection on any [`FrameError`].

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the length prefix.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Maximum payload size (8 MiB).
///
/// Inbound frames advertising more than this are rejected before any
/// allocation, bounding memory per connection.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Errors produced by framing and payload decoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    /// Payload exceeds [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge {
        /// Advertised or actual payload size.
        size: usize,
    },

    /// Payload bytes did not decode to the expected packet.
    #[error("corrupt frame: {reason}")]
    Corrupt {
        /// Decoder diagnostic.
        reason: String,
    },

    /// Packet could not be encoded.
    #[error("encode failed: {reason}")]
    Encode {
        /// Encoder diagnostic.
        reason: String,
    },

    /// Socket failed or closed while a frame was expected.
    #[error("i/o: {reason}")]
    Io {
        /// Underlying error text.
        reason: String,
    },
}

/// Frame a raw payload: length prefix followed by the payload bytes.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
        });
    }
    let mut frame = Vec::with_capacity(LEN_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Try to take one complete frame off the front of a read buffer.
///
/// Returns `Ok(None)` when more bytes are needed; the buffer is only drained
/// when a full frame is available.
pub fn try_take_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, FrameError> {
    if buf.len() < LEN_PREFIX_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { size: len });
    }
    if buf.len() < LEN_PREFIX_SIZE + len {
        return Ok(None);
    }
    let payload = buf[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + len].to_vec();
    buf.drain(..LEN_PREFIX_SIZE + len);
    Ok(Some(payload))
}

/// Encode a packet into a ready-to-write frame.
pub fn encode_packet<T: Serialize>(packet: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(packet).map_err(|e| FrameError::Encode {
        reason: e.to_string(),
    })?;
    encode_frame(&payload)
}

/// Decode a frame payload into a packet.
pub fn decode_packet<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(payload).map_err(|e| FrameError::Corrupt {
        reason: e.to_string(),
    })
}

/// Read exactly one frame, awaiting more bytes as needed.
///
/// Used on the sequential control-channel path; the steady-state data loops
/// read into their own buffers and drain with [`try_take_frame`]. A clean
/// peer close before a full frame is an [`FrameError::Io`].
pub(crate) async fn read_frame<S>(stream: &mut S, buf: &mut Vec<u8>) -> Result<Vec<u8>, FrameError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = try_take_frame(buf)? {
            return Ok(frame);
        }
        let n = stream.read_buf(buf).await.map_err(|e| FrameError::Io {
            reason: e.to_string(),
        })?;
        if n == 0 {
            return Err(FrameError::Io {
                reason: "connection closed before a full frame".to_string(),
            });
        }
    }
}
