//! # roomcast-core
//!
//! Rooms, ordered event routing and presence for the roomcast hub.
//!
//! - **Connection manager** - authenticates clients, tracks liveness
//! - **Room registry** - local room membership and ordered delivery
//! - **Event router** - sequences, persists and fans out events across instances
//! - **Presence tracker** - online/away/offline with grace and TTL expiry
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Connections │────▶│   Router    │────▶│  Registry   │──▶ outbound queues
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │              │        ▲
//!        ▼              ▼        │
//! ┌─────────────┐   ┌──────────────────┐
//! │  Presence   │   │  Store / Broker  │
//! └─────────────┘   └──────────────────┘
//! ```
//!
//! The store, broker and authenticator are ports ([`ports`]); in-memory
//! adapters live in [`memory`].

pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod identity;
pub mod memory;
pub mod ports;
pub mod presence;
pub mod registry;
pub mod room;
pub mod router;

pub use config::HubConfig;
pub use connection::{CloseSignal, ConnectionManager, Session};
pub use error::{AuthError, BrokerError, CloseReason, HubError, RejectReason, StoreError};
pub use hub::{Hub, HubStats};
pub use identity::{Identity, PresenceRecord};
pub use ports::{Authenticator, Broker, BrokerStream, EventStore, Ports};
pub use presence::PresenceTracker;
pub use registry::{Membership, RoomRegistry};
pub use room::{broadcast_room, private_room, RoomKey, RoomKind};
pub use router::{EventRouter, Producer, PublishRequest};
