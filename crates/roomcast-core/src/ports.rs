//! Interfaces to the hub's external collaborators.
//!
//! The hub never talks to a database, a broker or an identity provider
//! directly. It consumes these traits; adapters live outside the core (the
//! in-memory ones in [`crate::memory`] serve tests and single-instance setups).

use crate::error::{AuthError, BrokerError, StoreError};
use crate::identity::{Identity, PresenceRecord};
use crate::room::RoomKey;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use roomcast_protocol::{Event, EventId, IdentityId, TenantId};
use std::sync::Arc;
use std::time::Duration;

/// Stream of raw broker messages for one channel.
pub type BrokerStream = BoxStream<'static, Bytes>;

/// Durable store for events, identities and presence.
///
/// # Contract
///
/// - `reserve_next_event_id` is linearizable across every hub instance that
///   shares the store: two calls for the same room never return the same id,
///   and ids returned for a room strictly increase.
/// - A reserved id that is never written is a gap, not an error.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically increment and return the room's event counter.
    async fn reserve_next_event_id(&self, room: &RoomKey) -> Result<EventId, StoreError>;

    /// Durably record an event. `ttl` is set for ephemeral events.
    async fn write_event(&self, event: &Event, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Most recent non-ephemeral, unexpired events, oldest first.
    async fn read_recent_events(
        &self,
        room: &RoomKey,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    /// Highest event id durably written for the room.
    async fn latest_event_id(&self, room: &RoomKey) -> Result<Option<EventId>, StoreError>;

    /// Canonical identity record, if the store knows one.
    async fn read_identity(
        &self,
        tenant: &TenantId,
        identity: &IdentityId,
    ) -> Result<Option<Identity>, StoreError>;

    /// Insert or replace the presence one instance reports for an identity.
    /// Records of other instances are kept. The store expires the record at
    /// `expires_at`.
    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError>;

    /// Overall presence of an identity: the liveliest unexpired record over
    /// every instance, as chosen by [`PresenceRecord::liveliest`].
    async fn read_presence(
        &self,
        tenant: &TenantId,
        identity: &IdentityId,
    ) -> Result<Option<PresenceRecord>, StoreError>;
}

/// Cross-instance publish/subscribe.
///
/// Delivery is at-least-once and carries no ordering guarantee. A broker
/// typically echoes a message to the publishing instance's own subscription.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish raw bytes on a channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe this instance to a channel.
    async fn subscribe(&self, channel: &str) -> Result<BrokerStream, BrokerError>;

    /// Drop this instance's subscription to a channel. Open streams end.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError>;
}

/// Token verification.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify a token against a tenant claim and resolve the identity.
    async fn verify(&self, token: &str, tenant_claim: &TenantId) -> Result<Identity, AuthError>;
}

/// The collaborators a hub is constructed with.
#[derive(Clone)]
pub struct Ports {
    /// Durable store.
    pub store: Arc<dyn EventStore>,
    /// Cross-instance broker.
    pub broker: Arc<dyn Broker>,
    /// Token verification.
    pub auth: Arc<dyn Authenticator>,
}

impl Ports {
    /// Bundle the collaborators.
    pub fn new(
        store: Arc<dyn EventStore>,
        broker: Arc<dyn Broker>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            store,
            broker,
            auth,
        }
    }
}

impl std::fmt::Debug for Ports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ports").finish_non_exhaustive()
    }
}
