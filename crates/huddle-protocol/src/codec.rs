//! Codec for encoding and decoding Huddle events.
//!
//! Two encodings are supported:
//!
//! - **Json** - plain JSON, carried in WebSocket text frames
//! - **MessagePack** - length-prefixed MessagePack, carried in WebSocket binary frames

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Wire encoding of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Json,
    MessagePack,
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error in either direction.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a value with the given encoding.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode<T: Serialize>(value: &T, encoding: Encoding) -> Result<Bytes, ProtocolError> {
    match encoding {
        Encoding::Json => {
            let payload = serde_json::to_vec(value)?;
            if payload.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(payload.len()));
            }
            Ok(Bytes::from(payload))
        }
        Encoding::MessagePack => {
            let mut buf = BytesMut::new();
            encode_into(value, &mut buf)?;
            Ok(buf.freeze())
        }
    }
}

/// Encode a value as a length-prefixed MessagePack frame into an existing buffer.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded map
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a complete frame with the given encoding.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8], encoding: Encoding) -> Result<T, ProtocolError> {
    match encoding {
        Encoding::Json => {
            if data.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(data.len()));
            }
            Ok(serde_json::from_slice(data)?)
        }
        Encoding::MessagePack => {
            if data.len() < LENGTH_PREFIX_SIZE {
                return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
            }

            let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if length > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(length));
            }

            let total_size = LENGTH_PREFIX_SIZE + length;
            if data.len() < total_size {
                return Err(ProtocolError::Incomplete(total_size - data.len()));
            }

            Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
        }
    }
}

/// Payload length announced by the prefix at the start of `buf`, if the
/// prefix has arrived.
#[must_use]
pub fn frame_length(buf: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = buf.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Try to decode a MessagePack frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(value))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    let Some(length) = frame_length(buf) else {
        return Ok(None);
    };

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let value = rmp_serde::from_slice(&payload)?;

    Ok(Some(value))
}
