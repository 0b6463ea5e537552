//! Codecs for roomcast frames.
//!
//! Client frames are line-delimited JSON: each frame is a single JSON document
//! followed by `\n`. Events crossing the broker are wrapped in a
//! [`BrokerEnvelope`] and encoded with MessagePack.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::Event;
use crate::ids::InstanceId;

/// Maximum frame size (64 KiB), newline excluded.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Envelope encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Envelope decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame as one JSON line.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_into<T: Serialize>(frame: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(payload.len() + 1);
    buf.extend_from_slice(&payload);
    buf.put_u8(DELIMITER);

    Ok(())
}

/// Decode a single frame. A trailing newline is optional.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid frame.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    let line = data.strip_suffix(&[DELIMITER]).unwrap_or(data);

    if line.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(line.len()));
    }
    if line.contains(&DELIMITER) {
        return Err(ProtocolError::Invalid("more than one frame".into()));
    }

    Ok(serde_json::from_slice(line)?)
}

/// Try to decode a frame from a buffer, advancing it past the consumed line.
///
/// Returns `Ok(Some(frame))` if a complete line was decoded, `Ok(None)` if
/// more data is needed. A malformed line is consumed before its error is
/// returned, so decoding can continue with the next line. Blank lines are
/// skipped.
///
/// # Errors
///
/// Returns an error if the line is not a valid frame, or if no delimiter was
/// found within [`MAX_FRAME_SIZE`] bytes (the buffer is cleared in that case).
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    loop {
        let Some(pos) = buf.iter().position(|b| *b == DELIMITER) else {
            if buf.len() > MAX_FRAME_SIZE {
                let len = buf.len();
                buf.clear();
                return Err(ProtocolError::FrameTooLarge(len));
            }
            return Ok(None);
        };

        let line = buf.split_to(pos + 1);
        let line = &line[..pos];

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        if line.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(line.len()));
        }

        return Ok(Some(serde_json::from_slice(line)?));
    }
}

/// An event as published to the broker by one hub instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEnvelope {
    /// Instance that sequenced and published the event.
    pub origin: InstanceId,
    /// The persisted event.
    pub event: Event,
}

/// Encode a broker envelope with MessagePack.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_envelope(envelope: &BrokerEnvelope) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(envelope)?))
}

/// Decode a broker envelope.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid envelope.
pub fn decode_envelope(data: &[u8]) -> Result<BrokerEnvelope, ProtocolError> {
    Ok(rmp_serde::from_slice(data)?)
}
