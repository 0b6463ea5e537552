//! Transport abstraction traits for roomcast.
//!
//! A [`Transport`] is one duplex client session. The server drives every
//! session through this trait, so it does not care whether frames arrive over
//! a WebSocket or an in-process channel.

use async_trait::async_trait;
use bytes::BytesMut;
use roomcast_protocol::codec::{self, MAX_FRAME_SIZE};
use roomcast_protocol::{ClientFrame, CloseCode, ProtocolError, ServerFrame};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Something read from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A decoded frame.
    Frame(ClientFrame),
    /// A transport-level keepalive.
    Ping,
    /// A line that could not be decoded. The session continues.
    Malformed(String),
}

/// One duplex client session.
#[async_trait]
pub trait Transport: Send {
    /// Receive the next inbound item.
    ///
    /// Returns `None` once the client has gone away. Cancel safe: dropping
    /// the future loses no data.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;

    /// Send a frame to the client.
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError>;

    /// Close the session with a code. Closing twice is a no-op.
    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), TransportError>;

    /// Transport name (e.g. "websocket").
    fn name(&self) -> &'static str;

    /// Remote address of the client, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Whether the session is still open.
    fn is_open(&self) -> bool;
}

/// Splits received bytes into line-delimited client frames.
///
/// Every message handed to [`FrameReader::push`] ends a frame, whether or
/// not it carries the trailing newline.
#[derive(Debug)]
pub struct FrameReader {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameReader {
    /// Create a reader that refuses messages above `max_frame_size` bytes.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    /// Buffer one received message. Oversized messages are dropped and
    /// reported.
    pub fn push(&mut self, data: &[u8]) -> Option<Inbound> {
        if data.len() > self.max_frame_size {
            return Some(Inbound::Malformed(
                ProtocolError::FrameTooLarge(data.len()).to_string(),
            ));
        }
        self.buffer.extend_from_slice(data);
        if !data.ends_with(&[codec::DELIMITER]) {
            self.buffer.extend_from_slice(&[codec::DELIMITER]);
        }
        None
    }

    /// Take the next complete frame out of the buffer.
    pub fn next_frame(&mut self) -> Option<Inbound> {
        match codec::decode_from::<ClientFrame>(&mut self.buffer) {
            Ok(Some(frame)) => Some(Inbound::Frame(frame)),
            Ok(None) => None,
            Err(err) => Some(Inbound::Malformed(err.to_string())),
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}
