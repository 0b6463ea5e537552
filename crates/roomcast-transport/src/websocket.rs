//! WebSocket transport over axum's upgraded sockets.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use roomcast_protocol::{codec, CloseCode, ServerFrame};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{FrameReader, Inbound, Transport, TransportError};

/// A client session on an upgraded axum WebSocket.
pub struct AxumWebSocket {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    reader: FrameReader,
    open: bool,
}

impl AxumWebSocket {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>, max_message_size: usize) -> Self {
        Self {
            socket,
            remote_addr,
            reader: FrameReader::new(max_message_size),
            open: true,
        }
    }
}

#[async_trait]
impl Transport for AxumWebSocket {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            // First, drain frames already buffered
            if let Some(inbound) = self.reader.next_frame() {
                return Ok(Some(inbound));
            }

            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(refused) = self.reader.push(text.as_bytes()) {
                        warn!(size = text.len(), "Message too large");
                        return Ok(Some(refused));
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(refused) = self.reader.push(&data) {
                        warn!(size = data.len(), "Message too large");
                        return Ok(Some(refused));
                    }
                }
                // Pongs to pings are queued by the socket itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => return Ok(Some(Inbound::Ping)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(code = ?frame.as_ref().map(|f| f.code), "Received close frame");
                    self.open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket error");
                    self.open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    self.open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }

        let data = codec::encode(frame)?;
        let text = String::from_utf8(data.to_vec())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.socket.send(Message::Text(text)).await.map_err(|e| {
            self.open = false;
            TransportError::SendFailed(e.to_string())
        })
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), TransportError> {
        if !self.open {
            return Ok(()); // Already closed
        }
        self.open = false;

        let frame = CloseFrame {
            code: code.as_u16(),
            reason: reason.to_owned().into(),
        };
        self.socket
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {e}")))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
