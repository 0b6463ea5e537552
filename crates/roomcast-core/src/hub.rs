//! The hub: one serving process's rooms, connections and presence.
//!
//! A [`Hub`] is the explicit context object every transport driver is handed.
//! It is cheap to clone. Its background tasks stop when [`Hub::shutdown`] is
//! called or the last clone is dropped.

use crate::config::HubConfig;
use crate::connection::{ConnectionManager, Session};
use crate::error::{AuthError, CloseReason, HubError};
use crate::identity::Identity;
use crate::ports::Ports;
use crate::presence::PresenceTracker;
use crate::registry::{Membership, RoomRegistry};
use crate::room::{validate_room_id, RoomKey, RoomKind};
use crate::router::{EventRouter, Producer, PublishRequest};
use roomcast_protocol::{
    ConnectionId, Event, EventKind, IdentityId, PresenceStatus, RoomId, TenantId,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

struct HubInner {
    config: HubConfig,
    connections: ConnectionManager,
    registry: Arc<RoomRegistry>,
    router: Arc<EventRouter>,
    presence: Arc<PresenceTracker>,
    shutting_down: AtomicBool,
    stop: watch::Sender<bool>,
}

/// Multi-tenant room hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Build a hub and start its background tasks. Must be called from
    /// within a tokio runtime.
    #[must_use]
    pub fn start(config: HubConfig, ports: Ports) -> Self {
        let (evictions_tx, evictions_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RoomRegistry::new(
            config.max_rooms_per_connection,
            config.gap_timeout(),
        ));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&registry),
            Arc::clone(&ports.store),
            ports.broker,
            config.clone(),
            evictions_tx,
        ));
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&router),
            Arc::clone(&ports.store),
            config.instance_id.clone(),
            config.presence_grace,
            config.presence_ttl,
            config.persistence_timeout,
        ));
        let connections = ConnectionManager::new(
            ports.auth,
            ports.store,
            config.auth_timeout,
            config.idle_timeout,
            config.queue_capacity,
        );
        let (stop, stopped) = watch::channel(false);

        info!(instance = %config.instance_id, "Starting hub");

        let inner = Arc::new(HubInner {
            config,
            connections,
            registry,
            router,
            presence,
            shutting_down: AtomicBool::new(false),
            stop,
        });

        tokio::spawn(idle_sweeper(Arc::downgrade(&inner), stopped.clone()));
        tokio::spawn(eviction_loop(Arc::downgrade(&inner), evictions_rx, stopped));

        Self { inner }
    }

    /// Hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Authenticate a client and open a connection for it.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Auth`] if the handshake fails or the hub is
    /// shutting down.
    pub async fn accept(&self, token: &str, tenant_claim: &TenantId) -> Result<Session, HubError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(AuthError::Unavailable("hub is shutting down".into()).into());
        }

        let session = self.inner.connections.accept(token, tenant_claim).await?;
        self.inner.presence.connection_opened(&session.identity).await;
        Ok(session)
    }

    /// Record inbound traffic on a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub async fn heartbeat(&self, connection: &ConnectionId) -> Result<(), HubError> {
        self.inner.connections.heartbeat(connection)?;
        let identity = self.inner.connections.identity_of(connection)?;
        self.inner.presence.touch(&identity).await;
        Ok(())
    }

    /// Close a connection. Leaves its rooms, then updates presence, then
    /// signals the transport. Returns `false` if it was already closed.
    pub async fn close(&self, connection: &ConnectionId, reason: CloseReason) -> bool {
        let Some(entry) = self.inner.connections.remove(connection) else {
            return false;
        };

        let emptied = self.inner.registry.remove_connection(connection);
        for room in &emptied {
            self.inner.router.sync_feed(room).await;
        }

        self.inner.presence.connection_closed(&entry.identity).await;
        entry.closer.send_replace(Some(reason));

        info!(
            connection = %connection,
            identity = %entry.identity.identity_id,
            reason = %reason,
            "Connection closed"
        );
        true
    }

    /// Join a room. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a rejection if the room id is invalid or the identity may not
    /// watch the room, and [`HubError::ConnectionNotFound`] for unknown
    /// connections.
    pub async fn subscribe(
        &self,
        connection: &ConnectionId,
        room: &RoomId,
    ) -> Result<Membership, HubError> {
        let identity = self.inner.connections.identity_of(connection)?;
        let key = room_key(&identity, room)?;
        authorize_watch(&identity, &key)?;

        let outbox = self.inner.connections.outbox(connection)?;
        let seed = if self.inner.registry.local_member_count(&key) == 0 {
            self.inner.router.latest_event_id(&key).await
        } else {
            None
        };

        let membership = self
            .inner
            .registry
            .subscribe(connection, &key, &outbox, seed)?;
        // Returns once the room's broker feed is attached, also when another
        // subscribe is still attaching it.
        if membership.newly_joined {
            self.inner.router.sync_feed(&key).await;
        }
        Ok(membership)
    }

    /// Leave a room. Returns whether the connection was a member.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown connections or invalid room ids.
    pub async fn unsubscribe(
        &self,
        connection: &ConnectionId,
        room: &RoomId,
    ) -> Result<bool, HubError> {
        let identity = self.inner.connections.identity_of(connection)?;
        let key = room_key(&identity, room)?;

        let left = self.inner.registry.unsubscribe(connection, &key);
        if left.emptied {
            self.inner.router.sync_feed(&key).await;
        }
        Ok(left.was_member)
    }

    /// Local members of a room.
    #[must_use]
    pub fn members_of(&self, tenant: &TenantId, room: &RoomId) -> Vec<ConnectionId> {
        self.inner
            .registry
            .members_of(&RoomKey::new(tenant.clone(), room.clone()))
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn joined_rooms(&self, connection: &ConnectionId) -> Vec<RoomId> {
        self.inner
            .registry
            .joined_rooms(connection)
            .into_iter()
            .map(|key| key.room)
            .collect()
    }

    /// Publish an event from a connection.
    ///
    /// # Errors
    ///
    /// See [`EventRouter::publish`].
    pub async fn publish(
        &self,
        connection: &ConnectionId,
        room: &RoomId,
        kind: EventKind,
        payload: Value,
    ) -> Result<Arc<Event>, HubError> {
        let identity = self.inner.connections.identity_of(connection)?;
        let room = RoomKey::new(identity.tenant_id.clone(), room.clone());
        self.inner
            .router
            .publish(PublishRequest {
                room,
                producer: Producer::Connection {
                    connection: connection.clone(),
                    identity,
                },
                kind,
                payload,
            })
            .await
    }

    /// Inject a message from the hub itself, e.g. on behalf of a CRUD layer.
    ///
    /// # Errors
    ///
    /// See [`EventRouter::publish`].
    pub async fn publish_system_event(
        &self,
        tenant: &TenantId,
        room: &RoomId,
        payload: Value,
    ) -> Result<Arc<Event>, HubError> {
        self.publish_system(tenant, room, EventKind::Message, payload)
            .await
    }

    /// Publish any kind of event as the hub itself.
    ///
    /// # Errors
    ///
    /// See [`EventRouter::publish`].
    pub async fn publish_system(
        &self,
        tenant: &TenantId,
        room: &RoomId,
        kind: EventKind,
        payload: Value,
    ) -> Result<Arc<Event>, HubError> {
        self.inner
            .router
            .publish(PublishRequest {
                room: RoomKey::new(tenant.clone(), room.clone()),
                producer: Producer::System(Identity::system(tenant.clone())),
                kind,
                payload,
            })
            .await
    }

    /// Set the connection's identity to `online` or `away`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown connections or a disallowed status.
    pub async fn set_status(
        &self,
        connection: &ConnectionId,
        status: PresenceStatus,
    ) -> Result<(), HubError> {
        let identity = self.inner.connections.identity_of(connection)?;
        self.inner.presence.set_status(&identity, status).await
    }

    /// Current presence of an identity.
    pub async fn presence_of(&self, tenant: &TenantId, identity: &IdentityId) -> PresenceStatus {
        self.inner.presence.status_of(tenant, identity).await
    }

    /// Recent non-ephemeral events of a room the connection may watch,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Returns a rejection if the connection may not watch the room, or a
    /// persistence error.
    pub async fn recent_history(
        &self,
        connection: &ConnectionId,
        room: &RoomId,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, HubError> {
        let identity = self.inner.connections.identity_of(connection)?;
        let key = room_key(&identity, room)?;
        authorize_watch(&identity, &key)?;
        self.inner.router.recent_history(&key, limit).await
    }

    /// Hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let rooms = self.inner.registry.stats();
        HubStats {
            connections: self.inner.connections.count(),
            rooms: rooms.room_count,
            memberships: rooms.total_memberships,
            broker_feeds: self.inner.router.active_feeds(),
            tracked_identities: self.inner.presence.tracked(),
        }
    }

    /// Stop accepting connections, close every connection and stop all
    /// background work.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Hub shutting down");

        self.inner.stop.send_replace(true);
        for connection in self.inner.connections.connection_ids() {
            self.close(&connection, CloseReason::Shutdown).await;
        }
        self.inner.router.shutdown().await;
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Live connections.
    pub connections: usize,
    /// Rooms with local members.
    pub rooms: usize,
    /// Total room memberships.
    pub memberships: usize,
    /// Rooms with a running broker feed.
    pub broker_feeds: usize,
    /// Identities with presence state on this instance.
    pub tracked_identities: usize,
}

fn room_key(identity: &Identity, room: &RoomId) -> Result<RoomKey, HubError> {
    validate_room_id(room).map_err(HubError::invalid)?;
    Ok(RoomKey::new(identity.tenant_id.clone(), room.clone()))
}

/// Whether `identity` may subscribe to or read the history of a room.
///
/// # Errors
///
/// Returns an unauthorized rejection.
pub fn authorize_watch(identity: &Identity, room: &RoomKey) -> Result<(), HubError> {
    if identity.tenant_id != room.tenant {
        return Err(HubError::unauthorized("room belongs to another tenant"));
    }
    match room.kind() {
        RoomKind::Conversation => Ok(()),
        RoomKind::TenantBroadcast if identity.is_privileged() => Ok(()),
        RoomKind::TenantBroadcast => Err(HubError::unauthorized(
            "only agents may watch the broadcast room",
        )),
        RoomKind::IdentityPrivate(owner)
            if owner == identity.identity_id || identity.is_privileged() =>
        {
            Ok(())
        }
        RoomKind::IdentityPrivate(_) => Err(HubError::unauthorized(
            "private room of another identity",
        )),
    }
}

async fn idle_sweeper(hub: Weak<HubInner>, mut stopped: watch::Receiver<bool>) {
    let Some(interval) = hub.upgrade().map(|inner| inner.config.idle_sweep_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            _ = ticker.tick() => {
                let Some(inner) = hub.upgrade() else {
                    break;
                };
                let live = Hub { inner };
                for connection in live.inner.connections.idle_connections() {
                    debug!(connection = %connection, "Closing idle connection");
                    live.close(&connection, CloseReason::IdleTimeout).await;
                }
            }
        }
    }
    debug!("Idle sweeper stopped");
}

async fn eviction_loop(
    hub: Weak<HubInner>,
    mut evictions: mpsc::UnboundedReceiver<ConnectionId>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            evicted = evictions.recv() => {
                let Some(connection) = evicted else {
                    break;
                };
                let Some(inner) = hub.upgrade() else {
                    break;
                };
                warn!(connection = %connection, "Evicting slow consumer");
                Hub { inner }.close(&connection, CloseReason::Backpressure).await;
            }
        }
    }
    debug!("Eviction loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryStore, StaticAuthenticator};
    use crate::room::{broadcast_room, private_room};
    use crate::RejectReason;

    fn hub() -> Hub {
        let auth = StaticAuthenticator::new()
            .with_token("tok-a", Identity::agent("a", "acme"))
            .with_token("tok-v", Identity::visitor("v", "acme"));
        Hub::start(
            HubConfig::default(),
            Ports::new(
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryBroker::new().client()),
                Arc::new(auth),
            ),
        )
    }

    #[test]
    fn test_watch_authorization() {
        let agent = Identity::agent("a", "acme");
        let visitor = Identity::visitor("v", "acme");
        let conv = RoomKey::new("acme", "conv-1");
        let broadcast = RoomKey::new("acme", broadcast_room());
        let visitor_room = RoomKey::new("acme", private_room(&visitor.identity_id));
        let agent_room = RoomKey::new("acme", private_room(&agent.identity_id));

        assert!(authorize_watch(&visitor, &conv).is_ok());
        assert!(authorize_watch(&visitor, &broadcast).is_err());
        assert!(authorize_watch(&agent, &broadcast).is_ok());
        assert!(authorize_watch(&visitor, &visitor_room).is_ok());
        assert!(authorize_watch(&agent, &visitor_room).is_ok());
        assert!(authorize_watch(&visitor, &agent_room).is_err());
        assert!(authorize_watch(&agent, &RoomKey::new("globex", "conv-1")).is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_signals() {
        let hub = hub();
        let mut session = hub.accept("tok-a", &TenantId::new("acme")).await.unwrap();
        hub.subscribe(&session.connection_id, &RoomId::new("conv-1"))
            .await
            .unwrap();

        assert!(hub.close(&session.connection_id, CloseReason::ClientClosed).await);
        assert!(!hub.close(&session.connection_id, CloseReason::ClientClosed).await);
        assert_eq!(session.closed.wait().await, CloseReason::ClientClosed);
        assert_eq!(hub.stats().rooms, 0);
        assert_eq!(hub.stats().broker_feeds, 0);
    }

    #[tokio::test]
    async fn test_visitor_cannot_watch_broadcast() {
        let hub = hub();
        let session = hub.accept("tok-v", &TenantId::new("acme")).await.unwrap();

        let err = hub
            .subscribe(&session.connection_id, &broadcast_room())
            .await
            .unwrap_err();
        assert_eq!(err.reject_reason(), Some(RejectReason::Unauthorized));
        assert!(hub.joined_rooms(&session.connection_id).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let hub = hub();
        let mut session = hub.accept("tok-a", &TenantId::new("acme")).await.unwrap();

        hub.shutdown().await;
        assert_eq!(session.closed.wait().await, CloseReason::Shutdown);
        assert_eq!(hub.stats().connections, 0);
        assert!(hub.accept("tok-a", &TenantId::new("acme")).await.is_err());
    }
}
