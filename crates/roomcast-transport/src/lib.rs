//! # roomcast-transport
//!
//! Client transports for the roomcast hub.
//!
//! - **WebSocket** - upgraded axum sockets, one JSON frame per line
//! - **Memory** - an in-process pair for driving sessions in tests
//!
//! ## Transport Abstraction
//!
//! Every transport implements [`Transport`], so the session driver is
//! protocol-agnostic.
//!
//! ```rust,ignore
//! use roomcast_transport::{Inbound, Transport};
//!
//! async fn drive(mut transport: impl Transport) {
//!     while let Ok(Some(inbound)) = transport.recv().await {
//!         // Handle inbound
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;
pub mod websocket;

pub use traits::{FrameReader, Inbound, Transport, TransportError};
pub use websocket::AxumWebSocket;
