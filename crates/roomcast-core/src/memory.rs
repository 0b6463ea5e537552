//! In-memory port adapters.
//!
//! Suitable for tests and single-instance deployments. Several hubs in one
//! process can share a [`MemoryStore`] and a [`MemoryBroker`] to behave like
//! separate instances behind a real store and broker.

use crate::error::{AuthError, BrokerError, StoreError};
use crate::identity::{Identity, PresenceRecord};
use crate::ports::{Authenticator, Broker, BrokerStream, EventStore};
use crate::room::RoomKey;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use roomcast_protocol::{now_millis, Event, EventId, IdentityId, InstanceId, TenantId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default number of events retained per room.
const DEFAULT_RETENTION: usize = 1000;

struct StoredEvent {
    event: Event,
    expires_at: Option<Instant>,
}

impl StoredEvent {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct RoomLog {
    events: BTreeMap<EventId, StoredEvent>,
    latest: Option<EventId>,
}

struct StoreInner {
    counters: DashMap<RoomKey, EventId>,
    logs: DashMap<RoomKey, RoomLog>,
    identities: DashMap<(TenantId, IdentityId), Identity>,
    presence: DashMap<(TenantId, IdentityId), HashMap<InstanceId, PresenceRecord>>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
    retention: usize,
}

/// In-memory [`EventStore`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create an empty store keeping at most `retention` events per room.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                counters: DashMap::new(),
                logs: DashMap::new(),
                identities: DashMap::new(),
                presence: DashMap::new(),
                fail_writes: AtomicBool::new(false),
                write_delay_ms: AtomicU64::new(0),
                retention: retention.max(1),
            }),
        }
    }

    /// Register a canonical identity record.
    pub fn insert_identity(&self, identity: Identity) {
        self.inner.identities.insert(
            (identity.tenant_id.clone(), identity.identity_id.clone()),
            identity,
        );
    }

    /// Make every subsequent `write_event` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent `write_event`.
    pub fn set_write_delay(&self, delay: Duration) {
        self.inner
            .write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of events currently held for a room, ephemeral ones included.
    #[must_use]
    pub fn event_count(&self, room: &RoomKey) -> usize {
        self.inner.logs.get(room).map_or(0, |log| log.events.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn reserve_next_event_id(&self, room: &RoomKey) -> Result<EventId, StoreError> {
        let mut counter = self.inner.counters.entry(room.clone()).or_insert(0);
        *counter += 1;
        trace!(room = %room, event_id = *counter, "Reserved event id");
        Ok(*counter)
    }

    async fn write_event(&self, event: &Event, ttl: Option<Duration>) -> Result<(), StoreError> {
        let delay = self.inner.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }

        let key = RoomKey::new(event.tenant_id.clone(), event.room_id.clone());
        let mut log = self.inner.logs.entry(key).or_default();
        if log.events.contains_key(&event.event_id) {
            return Err(StoreError::Conflict(format!(
                "event {} already written",
                event.event_id
            )));
        }

        log.events.insert(
            event.event_id,
            StoredEvent {
                event: event.clone(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        log.latest = log.latest.max(Some(event.event_id));

        while log.events.len() > self.inner.retention {
            log.events.pop_first();
        }

        Ok(())
    }

    async fn read_recent_events(
        &self,
        room: &RoomKey,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let Some(log) = self.inner.logs.get(room) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut events: Vec<Event> = log
            .events
            .values()
            .rev()
            .filter(|stored| stored.is_live(now) && !stored.event.is_ephemeral())
            .take(limit)
            .map(|stored| stored.event.clone())
            .collect();
        events.reverse();

        Ok(events)
    }

    async fn latest_event_id(&self, room: &RoomKey) -> Result<Option<EventId>, StoreError> {
        Ok(self.inner.logs.get(room).and_then(|log| log.latest))
    }

    async fn read_identity(
        &self,
        tenant: &TenantId,
        identity: &IdentityId,
    ) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .inner
            .identities
            .get(&(tenant.clone(), identity.clone()))
            .map(|entry| entry.clone()))
    }

    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        self.inner
            .presence
            .entry((record.tenant_id.clone(), record.identity_id.clone()))
            .or_default()
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn read_presence(
        &self,
        tenant: &TenantId,
        identity: &IdentityId,
    ) -> Result<Option<PresenceRecord>, StoreError> {
        let key = (tenant.clone(), identity.clone());
        let now = now_millis();
        let Some(mut records) = self.inner.presence.get_mut(&key) else {
            return Ok(None);
        };
        // Expired records vanish like keys with a TTL would.
        records.retain(|_, record| record.expires_at >= now);
        let liveliest = PresenceRecord::liveliest(records.values(), now).cloned();
        let empty = records.is_empty();
        drop(records);
        if empty {
            self.inner.presence.remove_if(&key, |_, records| records.is_empty());
        }
        Ok(liveliest)
    }
}

struct Subscriber {
    client: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct BusInner {
    channels: DashMap<String, Vec<Subscriber>>,
    available: AtomicBool,
    next_client: AtomicU64,
    published: AtomicU64,
}

/// An in-process broker bus shared by several hub instances.
///
/// Each instance talks to the bus through its own [`MemoryBrokerClient`].
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BusInner>,
}

impl MemoryBroker {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: DashMap::new(),
                available: AtomicBool::new(true),
                next_client: AtomicU64::new(1),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Create a handle for one hub instance.
    #[must_use]
    pub fn client(&self) -> MemoryBrokerClient {
        MemoryBrokerClient {
            id: self.inner.next_client.fetch_add(1, Ordering::Relaxed),
            bus: Arc::clone(&self.inner),
        }
    }

    /// Simulate an outage. Going down ends every open subscription stream.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            self.inner.channels.clear();
            debug!("Memory broker down, dropped all subscriptions");
        }
    }

    /// Number of subscriptions on a channel across all clients.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner.channels.get(channel).map_or(0, |subs| subs.len())
    }

    /// Number of messages accepted by the bus.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One instance's handle on a [`MemoryBroker`].
pub struct MemoryBrokerClient {
    id: u64,
    bus: Arc<BusInner>,
}

impl MemoryBrokerClient {
    fn check_available(&self) -> Result<(), BrokerError> {
        if self.bus.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker is down".into()))
        }
    }
}

#[async_trait]
impl Broker for MemoryBrokerClient {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.check_available()?;
        self.bus.published.fetch_add(1, Ordering::Relaxed);

        if let Some(mut subs) = self.bus.channels.get_mut(channel) {
            subs.retain(|sub| sub.tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerStream, BrokerError> {
        self.check_available()?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.bus
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                client: self.id,
                tx,
            });
        debug!(channel = %channel, client = self.id, "Memory broker subscription");

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|bytes| (bytes, rx))
        });
        Ok(stream.boxed())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.check_available()?;

        let id = self.id;
        if let Some(mut subs) = self.bus.channels.get_mut(channel) {
            subs.retain(|sub| sub.client != id);
        }
        self.bus
            .channels
            .remove_if(channel, |_, subs| subs.is_empty());
        Ok(())
    }
}

/// A fixed token table.
#[derive(Default)]
pub struct StaticAuthenticator {
    tokens: DashMap<String, Identity>,
}

impl StaticAuthenticator {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token, builder style.
    #[must_use]
    pub fn with_token(self, token: impl Into<String>, identity: Identity) -> Self {
        self.insert(token, identity);
        self
    }

    /// Add or replace a token.
    pub fn insert(&self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    /// Revoke a token.
    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn verify(&self, token: &str, tenant_claim: &TenantId) -> Result<Identity, AuthError> {
        let identity = self
            .tokens
            .get(token)
            .map(|entry| entry.clone())
            .ok_or(AuthError::InvalidToken)?;

        if &identity.tenant_id != tenant_claim {
            return Err(AuthError::TenantMismatch);
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_protocol::{EventKind, PresenceStatus};
    use serde_json::json;

    fn event(room: &RoomKey, id: EventId, kind: EventKind) -> Event {
        Event {
            event_id: id,
            room_id: room.room.clone(),
            tenant_id: room.tenant.clone(),
            kind,
            produced_by: IdentityId::new("agent-a"),
            payload: json!({"text": format!("m{id}")}),
            produced_at: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_reserve_is_monotonic_per_room() {
        let store = MemoryStore::new();
        let a = RoomKey::new("acme", "conv-1");
        let b = RoomKey::new("acme", "conv-2");

        assert_eq!(store.reserve_next_event_id(&a).await.unwrap(), 1);
        assert_eq!(store.reserve_next_event_id(&a).await.unwrap(), 2);
        assert_eq!(store.reserve_next_event_id(&b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recent_events_skip_ephemeral() {
        let store = MemoryStore::new();
        let room = RoomKey::new("acme", "conv-1");

        store
            .write_event(&event(&room, 1, EventKind::Message), None)
            .await
            .unwrap();
        store
            .write_event(
                &event(&room, 2, EventKind::TypingStart),
                Some(Duration::from_secs(30)),
            )
            .await
            .unwrap();
        store
            .write_event(&event(&room, 3, EventKind::Message), None)
            .await
            .unwrap();

        let recent = store.read_recent_events(&room, 10).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 3]);

        let last = store.read_recent_events(&room, 1).await.unwrap();
        assert_eq!(last[0].event_id, 3);
        assert_eq!(store.latest_event_id(&room).await.unwrap(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        let room = RoomKey::new("acme", "conv-1");
        let mut state = event(&room, 1, EventKind::RoomStateChanged);
        state.payload = json!({"state": "open"});

        store
            .write_event(&state, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(store.read_recent_events(&room, 10).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.read_recent_events(&room, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_write_conflicts() {
        let store = MemoryStore::new();
        let room = RoomKey::new("acme", "conv-1");
        let e = event(&room, 1, EventKind::Message);

        store.write_event(&e, None).await.unwrap();
        assert!(matches!(
            store.write_event(&e, None).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_retention_bound() {
        let store = MemoryStore::with_retention(2);
        let room = RoomKey::new("acme", "conv-1");
        for id in 1..=3 {
            store
                .write_event(&event(&room, id, EventKind::Message), None)
                .await
                .unwrap();
        }
        assert_eq!(store.event_count(&room), 2);
        assert_eq!(store.latest_event_id(&room).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_presence_expires() {
        let store = MemoryStore::new();
        let record = PresenceRecord {
            tenant_id: TenantId::new("acme"),
            identity_id: IdentityId::new("agent-a"),
            instance_id: InstanceId::new("east"),
            status: PresenceStatus::Online,
            expires_at: now_millis().saturating_sub(1),
        };
        store.upsert_presence(&record).await.unwrap();

        let read = store
            .read_presence(&record.tenant_id, &record.identity_id)
            .await
            .unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_presence_is_kept_per_instance() {
        let store = MemoryStore::new();
        let report = |instance: &str, status| PresenceRecord {
            tenant_id: TenantId::new("acme"),
            identity_id: IdentityId::new("agent-a"),
            instance_id: InstanceId::new(instance),
            status,
            expires_at: now_millis() + 60_000,
        };

        store
            .upsert_presence(&report("east", PresenceStatus::Online))
            .await
            .unwrap();
        store
            .upsert_presence(&report("west", PresenceStatus::Online))
            .await
            .unwrap();
        store
            .upsert_presence(&report("east", PresenceStatus::Offline))
            .await
            .unwrap();

        let read = store
            .read_presence(&TenantId::new("acme"), &IdentityId::new("agent-a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.status, PresenceStatus::Online);
        assert_eq!(read.instance_id, InstanceId::new("west"));

        store
            .upsert_presence(&report("west", PresenceStatus::Offline))
            .await
            .unwrap();
        let read = store
            .read_presence(&TenantId::new("acme"), &IdentityId::new("agent-a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_broker_fan_out_and_unsubscribe() {
        let bus = MemoryBroker::new();
        let a = bus.client();
        let b = bus.client();

        let mut stream_a = a.subscribe("room:acme:conv-1").await.unwrap();
        let mut stream_b = b.subscribe("room:acme:conv-1").await.unwrap();
        assert_eq!(bus.subscriber_count("room:acme:conv-1"), 2);

        a.publish("room:acme:conv-1", Bytes::from_static(b"one"))
            .await
            .unwrap();
        assert_eq!(stream_a.next().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(stream_b.next().await.unwrap(), Bytes::from_static(b"one"));

        b.unsubscribe("room:acme:conv-1").await.unwrap();
        assert!(stream_b.next().await.is_none());
        assert_eq!(bus.subscriber_count("room:acme:conv-1"), 1);
    }

    #[tokio::test]
    async fn test_broker_outage() {
        let bus = MemoryBroker::new();
        let client = bus.client();
        let mut stream = client.subscribe("c").await.unwrap();

        bus.set_available(false);
        assert!(stream.next().await.is_none());
        assert!(client.publish("c", Bytes::new()).await.is_err());
        assert!(client.subscribe("c").await.is_err());

        bus.set_available(true);
        assert!(client.subscribe("c").await.is_ok());
    }

    #[tokio::test]
    async fn test_static_authenticator() {
        let auth = StaticAuthenticator::new().with_token("tok-a", Identity::agent("a", "acme"));

        let identity = auth.verify("tok-a", &TenantId::new("acme")).await.unwrap();
        assert_eq!(identity.identity_id, IdentityId::new("a"));

        assert_eq!(
            auth.verify("tok-a", &TenantId::new("globex")).await,
            Err(AuthError::TenantMismatch)
        );
        assert_eq!(
            auth.verify("nope", &TenantId::new("acme")).await,
            Err(AuthError::InvalidToken)
        );
    }
}
