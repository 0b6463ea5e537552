//! In-process transport for tests.
//!
//! [`pair`] returns the server half, which implements [`Transport`], and a
//! [`MemoryClient`] that plays the remote client.

use async_trait::async_trait;
use bytes::Bytes;
use roomcast_protocol::{codec, ClientFrame, CloseCode, ServerFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::traits::{FrameReader, Inbound, Transport, TransportError};

enum ClientMessage {
    Data(Bytes),
    Ping,
}

/// What the client side observes.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// A frame written by the server.
    Frame(ServerFrame),
    /// The server closed the session.
    Close(CloseCode, String),
}

/// Server half of an in-process session.
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<ClientMessage>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    reader: FrameReader,
    open: Arc<AtomicBool>,
}

/// Client half of an in-process session.
pub struct MemoryClient {
    tx: mpsc::UnboundedSender<ClientMessage>,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
    open: Arc<AtomicBool>,
}

/// Create a connected transport/client pair.
#[must_use]
pub fn pair() -> (MemoryTransport, MemoryClient) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    (
        MemoryTransport {
            inbound: server_rx,
            outbound: server_tx,
            reader: FrameReader::default(),
            open: Arc::clone(&open),
        },
        MemoryClient {
            tx: client_tx,
            rx: client_rx,
            open,
        },
    )
}

impl MemoryClient {
    /// Send a frame as one line.
    pub fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        let data = codec::encode(frame)?;
        self.send_raw(data)
    }

    /// Send raw bytes, e.g. a malformed line.
    pub fn send_raw(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.tx
            .send(ClientMessage::Data(data.into()))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a transport-level ping.
    pub fn ping(&self) -> Result<(), TransportError> {
        self.tx
            .send(ClientMessage::Ping)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Next thing the server sent. `None` once the server half is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// Whether the server has not closed the session.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            if let Some(inbound) = self.reader.next_frame() {
                return Ok(Some(inbound));
            }

            match self.inbound.recv().await {
                Some(ClientMessage::Data(data)) => {
                    if let Some(refused) = self.reader.push(&data) {
                        return Ok(Some(refused));
                    }
                }
                Some(ClientMessage::Ping) => return Ok(Some(Inbound::Ping)),
                None => {
                    self.open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        // Through the codec, so the client sees exactly what the wire carries.
        let data = codec::encode(frame)?;
        let frame = codec::decode(&data)?;
        self.outbound
            .send(ServerMessage::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // The client may already be gone.
        let _ = self
            .outbound
            .send(ServerMessage::Close(code, reason.to_string()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
