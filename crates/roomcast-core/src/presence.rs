//! Presence tracking.
//!
//! Each instance counts the live connections an identity holds on it and
//! stores its own view of the identity under its instance id. When the last
//! local connection closes the identity stays online for a grace period so
//! that quick reconnects go unnoticed, then this instance reports it offline.
//! `away` is only ever set by the client.
//!
//! An identity is online while any instance reports it online. Transitions
//! are announced as `presenceChanged` events in the identity's private room
//! and the tenant broadcast room, except where another instance's record
//! already covers them: no `online` for an identity online elsewhere, no
//! `offline` while it is still connected elsewhere. Transitions of one
//! identity on one instance are announced in order.

use crate::error::HubError;
use crate::identity::{Identity, PresenceRecord};
use crate::ports::EventStore;
use crate::room::{broadcast_room, private_room, RoomKey};
use crate::router::{EventRouter, Producer, PublishRequest};
use dashmap::DashMap;
use roomcast_protocol::{now_millis, EventKind, IdentityId, InstanceId, PresenceStatus, TenantId};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

type PresenceKey = (TenantId, IdentityId);

struct IdentityPresence {
    live: usize,
    status: PresenceStatus,
    // Bumped on every connect and last close; a grace timer only fires for
    // the generation it was started in.
    generation: u64,
    refreshed_at: Instant,
    lock: Arc<Mutex<()>>,
}

impl IdentityPresence {
    fn new() -> Self {
        Self {
            live: 0,
            status: PresenceStatus::Offline,
            generation: 0,
            refreshed_at: Instant::now(),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Per-identity presence with grace and TTL expiry.
pub struct PresenceTracker {
    entries: DashMap<PresenceKey, IdentityPresence>,
    router: Arc<EventRouter>,
    store: Arc<dyn EventStore>,
    instance_id: InstanceId,
    grace: Duration,
    ttl: Duration,
    store_timeout: Duration,
}

impl PresenceTracker {
    /// Create a tracker reporting as `instance_id` and announcing through
    /// `router`.
    #[must_use]
    pub fn new(
        router: Arc<EventRouter>,
        store: Arc<dyn EventStore>,
        instance_id: InstanceId,
        grace: Duration,
        ttl: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            router,
            store,
            instance_id,
            grace,
            ttl,
            store_timeout,
        }
    }

    /// A connection of `identity` was accepted.
    pub async fn connection_opened(&self, identity: &Identity) {
        let key = key_of(identity);
        let _guard = self.lock(&key, true).await;

        let changed = {
            let mut entry = self.entries.entry(key).or_insert_with(IdentityPresence::new);
            entry.live += 1;
            entry.generation += 1;
            if entry.live == 1 && entry.status != PresenceStatus::Online {
                entry.status = PresenceStatus::Online;
                entry.refreshed_at = Instant::now();
                true
            } else {
                false
            }
        };

        if changed {
            let elsewhere = self.stored_status(identity).await;
            self.record(identity, PresenceStatus::Online).await;
            if elsewhere == Some(PresenceStatus::Online) {
                debug!(identity = %identity.identity_id, "Already online on another instance");
            } else {
                self.broadcast(identity, PresenceStatus::Online).await;
            }
        }
    }

    /// A connection of `identity` closed. Starts the grace timer when it was
    /// the last one.
    pub async fn connection_closed(self: &Arc<Self>, identity: &Identity) {
        let key = key_of(identity);
        let Some(_guard) = self.lock(&key, false).await else {
            return;
        };

        let generation = {
            let Some(mut entry) = self.entries.get_mut(&key) else {
                return;
            };
            entry.live = entry.live.saturating_sub(1);
            if entry.live > 0 {
                return;
            }
            entry.generation += 1;
            entry.generation
        };

        debug!(
            identity = %identity.identity_id,
            grace = ?self.grace,
            "Last connection closed, starting grace period"
        );

        let tracker = Arc::clone(self);
        let identity = identity.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.grace).await;
            tracker.grace_expired(&identity, generation).await;
        });
    }

    /// Set a client-chosen status. Only `online` and `away` may be chosen.
    ///
    /// # Errors
    ///
    /// Returns an invalid-request rejection for `offline`.
    pub async fn set_status(
        &self,
        identity: &Identity,
        status: PresenceStatus,
    ) -> Result<(), HubError> {
        if status == PresenceStatus::Offline {
            return Err(HubError::invalid("offline cannot be set by a client"));
        }

        let key = key_of(identity);
        let _guard = self.lock(&key, true).await;

        let changed = {
            let mut entry = self.entries.entry(key).or_insert_with(IdentityPresence::new);
            if entry.status == status {
                false
            } else {
                entry.status = status;
                entry.refreshed_at = Instant::now();
                true
            }
        };

        if changed {
            self.announce(identity, status).await;
        }
        Ok(())
    }

    /// Refresh the stored TTL of an identity's presence. Writes at most
    /// twice per TTL.
    pub async fn touch(&self, identity: &Identity) {
        let status = {
            let Some(mut entry) = self.entries.get_mut(&key_of(identity)) else {
                return;
            };
            if entry.live == 0 || entry.refreshed_at.elapsed() < self.ttl / 2 {
                return;
            }
            entry.refreshed_at = Instant::now();
            entry.status
        };
        self.record(identity, status).await;
    }

    /// Current status of an identity.
    ///
    /// Uses this instance's view while the identity has live connections
    /// here, else the stored records of every instance, which read as offline
    /// once expired.
    pub async fn status_of(&self, tenant: &TenantId, identity: &IdentityId) -> PresenceStatus {
        let key = (tenant.clone(), identity.clone());
        if let Some(entry) = self.entries.get(&key) {
            if entry.live > 0 || entry.status != PresenceStatus::Offline {
                return entry.status;
            }
        }

        self.read_status(tenant, identity)
            .await
            .unwrap_or(PresenceStatus::Offline)
    }

    /// Live connections of an identity on this instance.
    #[must_use]
    pub fn live_connections(&self, tenant: &TenantId, identity: &IdentityId) -> usize {
        self.entries
            .get(&(tenant.clone(), identity.clone()))
            .map_or(0, |entry| entry.live)
    }

    /// Number of identities tracked on this instance.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    async fn grace_expired(&self, identity: &Identity, generation: u64) {
        let key = key_of(identity);
        let Some(_guard) = self.lock(&key, false).await else {
            return;
        };

        {
            let Some(mut entry) = self.entries.get_mut(&key) else {
                return;
            };
            if entry.generation != generation || entry.live > 0 {
                return;
            }
            entry.status = PresenceStatus::Offline;
        }

        self.record(identity, PresenceStatus::Offline).await;
        match self.stored_status(identity).await {
            Some(status) if status != PresenceStatus::Offline => {
                debug!(
                    identity = %identity.identity_id,
                    status = %status,
                    "Grace expired, identity still connected on another instance"
                );
            }
            _ => {
                info!(
                    identity = %identity.identity_id,
                    tenant = %identity.tenant_id,
                    "Identity offline"
                );
                self.broadcast(identity, PresenceStatus::Offline).await;
            }
        }
        self.entries
            .remove_if(&key, |_, entry| entry.live == 0 && entry.generation == generation);
    }

    // Serializes transitions of one identity. The guard is only valid for
    // the entry that was current when it was taken.
    async fn lock(&self, key: &PresenceKey, create: bool) -> Option<OwnedMutexGuard<()>> {
        loop {
            let lock = if create {
                Arc::clone(
                    &self
                        .entries
                        .entry(key.clone())
                        .or_insert_with(IdentityPresence::new)
                        .lock,
                )
            } else {
                Arc::clone(&self.entries.get(key)?.lock)
            };
            let guard = Arc::clone(&lock).lock_owned().await;
            let current = self
                .entries
                .get(key)
                .is_some_and(|entry| Arc::ptr_eq(&entry.lock, &lock));
            if current {
                return Some(guard);
            }
            if !create && !self.entries.contains_key(key) {
                return None;
            }
        }
    }

    async fn announce(&self, identity: &Identity, status: PresenceStatus) {
        self.record(identity, status).await;
        self.broadcast(identity, status).await;
    }

    async fn broadcast(&self, identity: &Identity, status: PresenceStatus) {
        let payload = json!({
            "identity": identity.identity_id,
            "status": status,
            "kind": identity.kind,
        });

        for room in [private_room(&identity.identity_id), broadcast_room()] {
            let request = PublishRequest {
                room: RoomKey::new(identity.tenant_id.clone(), room),
                producer: Producer::System(identity.clone()),
                kind: EventKind::PresenceChanged,
                payload: payload.clone(),
            };
            if let Err(err) = self.router.publish(request).await {
                warn!(
                    identity = %identity.identity_id,
                    status = %status,
                    error = %err,
                    "Announcing presence failed"
                );
            }
        }
        debug!(identity = %identity.identity_id, status = %status, "Presence changed");
    }

    async fn record(&self, identity: &Identity, status: PresenceStatus) {
        let record = PresenceRecord {
            tenant_id: identity.tenant_id.clone(),
            identity_id: identity.identity_id.clone(),
            instance_id: self.instance_id.clone(),
            status,
            expires_at: now_millis() + self.ttl.as_millis() as u64,
        };
        match timeout(self.store_timeout, self.store.upsert_presence(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(identity = %identity.identity_id, error = %err, "Storing presence failed");
            }
            Err(_) => warn!(identity = %identity.identity_id, "Storing presence timed out"),
        }
    }

    async fn stored_status(&self, identity: &Identity) -> Option<PresenceStatus> {
        self.read_status(&identity.tenant_id, &identity.identity_id)
            .await
    }

    // Overall stored status across instances. `None` when the store cannot
    // answer.
    async fn read_status(
        &self,
        tenant: &TenantId,
        identity: &IdentityId,
    ) -> Option<PresenceStatus> {
        match timeout(self.store_timeout, self.store.read_presence(tenant, identity)).await {
            Ok(Ok(Some(record))) => Some(record.status_at(now_millis())),
            Ok(Ok(None)) => Some(PresenceStatus::Offline),
            Ok(Err(err)) => {
                warn!(identity = %identity, error = %err, "Reading presence failed");
                None
            }
            Err(_) => {
                warn!(identity = %identity, "Reading presence timed out");
                None
            }
        }
    }
}

fn key_of(identity: &Identity) -> PresenceKey {
    (identity.tenant_id.clone(), identity.identity_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::memory::{MemoryBroker, MemoryStore};
    use crate::registry::{Outbox, RoomRegistry};
    use roomcast_protocol::ConnectionId;
    use tokio::sync::mpsc;

    struct Fixture {
        tracker: Arc<PresenceTracker>,
        registry: Arc<RoomRegistry>,
        store: MemoryStore,
        _evictions: mpsc::UnboundedReceiver<ConnectionId>,
    }

    fn fixture() -> Fixture {
        instance(MemoryStore::new())
    }

    // One instance over a store that other instances may share.
    fn instance(store: MemoryStore) -> Fixture {
        let config = HubConfig::default();
        let registry = Arc::new(RoomRegistry::new(100, config.gap_timeout()));
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(EventRouter::new(
            Arc::clone(&registry),
            Arc::new(store.clone()),
            Arc::new(MemoryBroker::new().client()),
            config.clone(),
            tx,
        ));
        let tracker = Arc::new(PresenceTracker::new(
            router,
            Arc::new(store.clone()),
            config.instance_id.clone(),
            config.presence_grace,
            config.presence_ttl,
            config.persistence_timeout,
        ));
        Fixture {
            tracker,
            registry,
            store,
            _evictions: rx,
        }
    }

    fn watch_private_room(f: &Fixture, identity: &Identity) -> mpsc::Receiver<Arc<roomcast_protocol::Event>> {
        let (outbox, rx) = Outbox::channel(16);
        let room = RoomKey::new(identity.tenant_id.clone(), private_room(&identity.identity_id));
        f.registry
            .subscribe(&ConnectionId::new("watcher"), &room, &outbox, None)
            .unwrap();
        rx
    }

    fn statuses(rx: &mut mpsc::Receiver<Arc<roomcast_protocol::Event>>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.payload["status"].as_str().unwrap_or_default().to_string());
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_after_grace() {
        let f = fixture();
        let a = Identity::agent("a", "acme");
        let mut rx = watch_private_room(&f, &a);

        f.tracker.connection_opened(&a).await;
        f.tracker.connection_closed(&a).await;
        assert_eq!(
            f.tracker.status_of(&a.tenant_id, &a.identity_id).await,
            PresenceStatus::Online
        );

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(statuses(&mut rx), vec!["online", "offline"]);
        assert_eq!(f.tracker.tracked(), 0);

        let stored = f
            .store
            .read_presence(&a.tenant_id, &a.identity_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_stays_online() {
        let f = fixture();
        let a = Identity::agent("a", "acme");
        let mut rx = watch_private_room(&f, &a);

        f.tracker.connection_opened(&a).await;
        f.tracker.connection_closed(&a).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        f.tracker.connection_opened(&a).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(statuses(&mut rx), vec!["online"]);
        assert_eq!(f.tracker.live_connections(&a.tenant_id, &a.identity_id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_on_another_instance_keeps_identity_online() {
        let store = MemoryStore::new();
        let east = instance(store.clone());
        let west = instance(store);
        let a = Identity::agent("a", "acme");
        let mut east_rx = watch_private_room(&east, &a);
        let mut west_rx = watch_private_room(&west, &a);

        east.tracker.connection_opened(&a).await;
        west.tracker.connection_opened(&a).await;
        assert_eq!(statuses(&mut east_rx), vec!["online"]);
        assert!(statuses(&mut west_rx).is_empty());

        east.tracker.connection_closed(&a).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(statuses(&mut east_rx).is_empty());
        assert_eq!(east.tracker.tracked(), 0);
        assert_eq!(
            east.tracker.status_of(&a.tenant_id, &a.identity_id).await,
            PresenceStatus::Online
        );

        // The last connection anywhere closing is what turns it offline
        west.tracker.connection_closed(&a).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(statuses(&mut west_rx), vec!["offline"]);
        assert_eq!(
            east.tracker.status_of(&a.tenant_id, &a.identity_id).await,
            PresenceStatus::Offline
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connection_keeps_identity_online() {
        let f = fixture();
        let a = Identity::agent("a", "acme");
        let mut rx = watch_private_room(&f, &a);

        f.tracker.connection_opened(&a).await;
        f.tracker.connection_opened(&a).await;
        f.tracker.connection_closed(&a).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(statuses(&mut rx), vec!["online"]);
    }

    #[tokio::test]
    async fn test_away_is_client_driven() {
        let f = fixture();
        let a = Identity::agent("a", "acme");
        let mut rx = watch_private_room(&f, &a);

        f.tracker.connection_opened(&a).await;
        f.tracker.set_status(&a, PresenceStatus::Away).await.unwrap();
        f.tracker.set_status(&a, PresenceStatus::Away).await.unwrap();
        assert!(f
            .tracker
            .set_status(&a, PresenceStatus::Offline)
            .await
            .is_err());

        assert_eq!(statuses(&mut rx), vec!["online", "away"]);
        assert_eq!(
            f.tracker.status_of(&a.tenant_id, &a.identity_id).await,
            PresenceStatus::Away
        );
    }

    #[tokio::test]
    async fn test_status_of_untracked_identity_reads_store() {
        let f = fixture();
        let tenant = TenantId::new("acme");
        let remote = IdentityId::new("remote");
        f.store
            .upsert_presence(&PresenceRecord {
                tenant_id: tenant.clone(),
                identity_id: remote.clone(),
                instance_id: InstanceId::new("elsewhere"),
                status: PresenceStatus::Away,
                expires_at: now_millis() + 60_000,
            })
            .await
            .unwrap();

        assert_eq!(f.tracker.status_of(&tenant, &remote).await, PresenceStatus::Away);
        assert_eq!(
            f.tracker.status_of(&tenant, &IdentityId::new("nobody")).await,
            PresenceStatus::Offline
        );
    }
}
