//! # roomcast-protocol
//!
//! Wire protocol definitions for the roomcast messaging hub.
//!
//! This crate defines what crosses process boundaries: identifiers, the
//! sequenced [`Event`] record, the line-delimited JSON frames exchanged with
//! clients, close codes, and the MessagePack envelope used on the broker.
//!
//! ## Frame Types
//!
//! - `connect` / `connected` - Handshake
//! - `subscribe` / `unsubscribe` - Room membership
//! - `message`, `typingStart`, `typingStop`, `roomState` - Publish into a room
//! - `status` - Presence away/online
//! - `history` - Recent history replay
//! - `event` / `ack` / `error` - Server responses
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{codec, ClientFrame};
//! use serde_json::json;
//!
//! let frame = ClientFrame::message("conv-1", json!({"text": "hi"}));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod event;
pub mod frames;
pub mod ids;
pub mod version;

pub use codec::{decode, encode, BrokerEnvelope, ProtocolError};
pub use event::{now_millis, Event, EventKind, IdentityKind, PresenceStatus};
pub use frames::{ClientFrame, CloseCode, ServerFrame};
pub use ids::{ConnectionId, EventId, IdentityId, InstanceId, RoomId, TenantId};
pub use version::{Version, PROTOCOL_VERSION};
