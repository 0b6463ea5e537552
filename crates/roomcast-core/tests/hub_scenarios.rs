//! End-to-end hub scenarios over the in-memory store, broker and
//! authenticator.

use async_trait::async_trait;
use roomcast_core::memory::{MemoryBroker, MemoryStore, StaticAuthenticator};
use roomcast_core::{
    private_room, Broker, CloseReason, EventStore, Hub, HubConfig, HubError, Identity, Ports,
    PresenceRecord, RejectReason, RoomKey, Session, StoreError,
};
use roomcast_protocol::codec::encode_envelope;
use roomcast_protocol::{
    BrokerEnvelope, Event, EventId, EventKind, IdentityId, InstanceId, PresenceStatus, RoomId,
    TenantId,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn acme() -> TenantId {
    TenantId::new("acme")
}

fn conv() -> RoomId {
    RoomId::new("conv-1")
}

fn authenticator() -> StaticAuthenticator {
    StaticAuthenticator::new()
        .with_token("tok-a", Identity::agent("a", "acme"))
        .with_token("tok-b", Identity::agent("b", "acme"))
        .with_token("tok-v", Identity::visitor("v", "acme"))
}

struct Cluster {
    store: MemoryStore,
    bus: MemoryBroker,
}

impl Cluster {
    fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            bus: MemoryBroker::new(),
        }
    }

    fn hub(&self, config: HubConfig) -> Hub {
        self.hub_with_store(config, Arc::new(self.store.clone()))
    }

    // An instance reaching the shared store through `store`.
    fn hub_with_store(&self, config: HubConfig, store: Arc<dyn EventStore>) -> Hub {
        Hub::start(
            config,
            Ports::new(store, Arc::new(self.bus.client()), Arc::new(authenticator())),
        )
    }
}

/// Store whose write of one event id takes `delay`.
struct SlowWrite {
    inner: MemoryStore,
    event_id: EventId,
    delay: Duration,
}

impl SlowWrite {
    fn new(inner: MemoryStore, event_id: EventId, delay: Duration) -> Arc<dyn EventStore> {
        Arc::new(Self {
            inner,
            event_id,
            delay,
        })
    }
}

#[async_trait]
impl EventStore for SlowWrite {
    async fn reserve_next_event_id(&self, room: &RoomKey) -> Result<EventId, StoreError> {
        self.inner.reserve_next_event_id(room).await
    }

    async fn write_event(&self, event: &Event, ttl: Option<Duration>) -> Result<(), StoreError> {
        if event.event_id == self.event_id {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.write_event(event, ttl).await
    }

    async fn read_recent_events(
        &self,
        room: &RoomKey,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        self.inner.read_recent_events(room, limit).await
    }

    async fn latest_event_id(&self, room: &RoomKey) -> Result<Option<EventId>, StoreError> {
        self.inner.latest_event_id(room).await
    }

    async fn read_identity(
        &self,
        tenant: &TenantId,
        identity: &IdentityId,
    ) -> Result<Option<Identity>, StoreError> {
        self.inner.read_identity(tenant, identity).await
    }

    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        self.inner.upsert_presence(record).await
    }

    async fn read_presence(
        &self,
        tenant: &TenantId,
        identity: &IdentityId,
    ) -> Result<Option<PresenceRecord>, StoreError> {
        self.inner.read_presence(tenant, identity).await
    }
}

async fn connect(hub: &Hub, token: &str) -> Session {
    hub.accept(token, &acme()).await.expect("handshake failed")
}

async fn next_event(session: &mut Session) -> Arc<Event> {
    next_event_within(session, WAIT).await
}

async fn next_event_within(session: &mut Session, wait: Duration) -> Arc<Event> {
    tokio::time::timeout(wait, session.events.recv())
        .await
        .expect("no event within timeout")
        .expect("event queue closed")
}

fn drain(session: &mut Session) -> Vec<EventId> {
    let mut ids = Vec::new();
    while let Ok(event) = session.events.try_recv() {
        ids.push(event.event_id);
    }
    ids
}

async fn say(hub: &Hub, session: &Session, text: &str) -> Result<Arc<Event>, HubError> {
    hub.publish(
        &session.connection_id,
        &conv(),
        EventKind::Message,
        json!({ "text": text }),
    )
    .await
}

#[tokio::test]
async fn test_two_participants_share_a_room() {
    let cluster = Cluster::new();
    let hub = cluster.hub(HubConfig::default());
    let mut a = connect(&hub, "tok-a").await;
    let mut b = connect(&hub, "tok-b").await;
    hub.subscribe(&a.connection_id, &conv()).await.unwrap();
    hub.subscribe(&b.connection_id, &conv()).await.unwrap();

    let first = say(&hub, &a, "hi").await.unwrap();
    assert_eq!(first.event_id, 1);

    let seen = next_event(&mut b).await;
    assert_eq!(seen.event_id, 1);
    assert_eq!(seen.payload["text"], "hi");
    assert_eq!(seen.produced_by, IdentityId::new("a"));
    assert!(drain(&mut b).is_empty());

    let second = say(&hub, &b, "hello").await.unwrap();
    assert_eq!(second.event_id, 2);
    assert_eq!(next_event(&mut b).await.event_id, 2);
    assert_eq!(drain(&mut a), vec![1, 2]);
}

#[tokio::test]
async fn test_publish_outside_membership_persists_nothing() {
    let cluster = Cluster::new();
    let hub = cluster.hub(HubConfig::default());
    let a = connect(&hub, "tok-a").await;
    let room = RoomId::new("conv-9");

    let err = hub
        .publish(
            &a.connection_id,
            &room,
            EventKind::Message,
            json!({ "text": "sneaky" }),
        )
        .await
        .unwrap_err();

    assert_eq!(err.reject_reason(), Some(RejectReason::Unauthorized));
    let stored = cluster
        .store
        .read_recent_events(&RoomKey::new(acme(), room), 50)
        .await
        .unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn test_resubscribe_is_a_no_op() {
    let cluster = Cluster::new();
    let hub = cluster.hub(HubConfig::default());
    let mut a = connect(&hub, "tok-a").await;

    let first = hub.subscribe(&a.connection_id, &conv()).await.unwrap();
    let again = hub.subscribe(&a.connection_id, &conv()).await.unwrap();
    assert!(first.newly_joined);
    assert!(!again.newly_joined);
    assert_eq!(hub.members_of(&acme(), &conv()).len(), 1);

    say(&hub, &a, "once").await.unwrap();
    assert_eq!(drain(&mut a), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_offline_is_announced_after_grace() {
    let cluster = Cluster::new();
    let hub = cluster.hub(HubConfig::default());
    let a = connect(&hub, "tok-a").await;
    let mut b = connect(&hub, "tok-b").await;
    hub.subscribe(&b.connection_id, &private_room(&a.identity.identity_id))
        .await
        .unwrap();

    hub.close(&a.connection_id, CloseReason::ClientClosed).await;
    assert_eq!(
        hub.presence_of(&acme(), &IdentityId::new("a")).await,
        PresenceStatus::Online
    );

    let event = next_event_within(&mut b, Duration::from_secs(15)).await;
    assert_eq!(event.kind, EventKind::PresenceChanged);
    assert_eq!(event.payload["identity"], "a");
    assert_eq!(event.payload["status"], "offline");
    assert_eq!(
        hub.presence_of(&acme(), &IdentityId::new("a")).await,
        PresenceStatus::Offline
    );
}

#[tokio::test(start_paused = true)]
async fn test_quick_reconnect_never_goes_offline() {
    let cluster = Cluster::new();
    let hub = cluster.hub(HubConfig::default());
    let a = connect(&hub, "tok-a").await;
    let mut b = connect(&hub, "tok-b").await;
    hub.subscribe(&b.connection_id, &private_room(&a.identity.identity_id))
        .await
        .unwrap();

    hub.close(&a.connection_id, CloseReason::ClientClosed).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let _a_again = connect(&hub, "tok-a").await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(drain(&mut b).is_empty());
    assert_eq!(
        hub.presence_of(&acme(), &IdentityId::new("a")).await,
        PresenceStatus::Online
    );
}

#[tokio::test]
async fn test_slow_consumer_is_evicted() {
    let cluster = Cluster::new();
    let config = HubConfig {
        queue_capacity: 4,
        ..HubConfig::default()
    };
    let hub = cluster.hub(config);
    let mut slow = connect(&hub, "tok-a").await;
    let mut fast = connect(&hub, "tok-b").await;
    hub.subscribe(&slow.connection_id, &conv()).await.unwrap();
    hub.subscribe(&fast.connection_id, &conv()).await.unwrap();

    let mut received = Vec::new();
    for i in 0..6 {
        hub.publish_system_event(&acme(), &conv(), json!({ "text": format!("m{i}") }))
            .await
            .unwrap();
        received.extend(drain(&mut fast));
    }

    let reason = tokio::time::timeout(WAIT, slow.closed.wait()).await.unwrap();
    assert_eq!(reason, CloseReason::Backpressure);
    assert_eq!(reason.close_code().as_u16(), 4002);
    assert_eq!(received, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(hub.members_of(&acme(), &conv()), vec![fast.connection_id.clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_is_closed() {
    let cluster = Cluster::new();
    let hub = cluster.hub(HubConfig::default());
    let mut quiet = connect(&hub, "tok-a").await;

    let reason = tokio::time::timeout(Duration::from_secs(120), quiet.closed.wait())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::IdleTimeout);
    assert_eq!(hub.stats().connections, 0);
}

#[tokio::test(start_paused = true)]
async fn test_persistence_timeout_broadcasts_nothing() {
    let cluster = Cluster::new();
    let hub = cluster.hub(HubConfig::default());
    let a = connect(&hub, "tok-a").await;
    let mut b = connect(&hub, "tok-b").await;
    hub.subscribe(&a.connection_id, &conv()).await.unwrap();
    hub.subscribe(&b.connection_id, &conv()).await.unwrap();

    cluster.store.set_write_delay(Duration::from_secs(10));
    let err = say(&hub, &a, "slow").await.unwrap_err();
    assert!(matches!(err, HubError::PersistenceTimeout(_)));
    assert!(err.is_transient());

    cluster.store.set_write_delay(Duration::ZERO);
    let next = say(&hub, &a, "fast").await.unwrap();
    assert_eq!(next.event_id, 2);
    assert_eq!(drain(&mut b), vec![2]);
}

#[tokio::test]
async fn test_history_skips_ephemeral_events() {
    let cluster = Cluster::new();
    let hub = cluster.hub(HubConfig::default());
    let a = connect(&hub, "tok-a").await;
    hub.subscribe(&a.connection_id, &conv()).await.unwrap();

    say(&hub, &a, "one").await.unwrap();
    hub.publish(
        &a.connection_id,
        &conv(),
        EventKind::TypingStart,
        serde_json::Value::Null,
    )
    .await
    .unwrap();
    say(&hub, &a, "two").await.unwrap();

    let history = hub
        .recent_history(&a.connection_id, &conv(), None)
        .await
        .unwrap();
    let texts: Vec<_> = history
        .iter()
        .map(|event| event.payload["text"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(texts, vec!["one", "two"]);
}

#[tokio::test]
async fn test_instances_deliver_in_order_without_duplicates() {
    let cluster = Cluster::new();
    let east = cluster.hub(HubConfig::default());
    let west = cluster.hub(HubConfig::default());
    let mut a = connect(&east, "tok-a").await;
    let mut b = connect(&west, "tok-b").await;
    east.subscribe(&a.connection_id, &conv()).await.unwrap();
    west.subscribe(&b.connection_id, &conv()).await.unwrap();

    for i in 0..3 {
        say(&east, &a, &format!("m{i}")).await.unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(next_event(&mut b).await.event_id);
    }
    assert_eq!(seen, vec![1, 2, 3]);

    let reply = say(&west, &b, "back").await.unwrap();
    assert_eq!(reply.event_id, 4);
    assert_eq!(next_event(&mut b).await.event_id, 4);

    let mut at_a = Vec::new();
    for _ in 0..4 {
        at_a.push(next_event(&mut a).await.event_id);
    }
    assert_eq!(at_a, vec![1, 2, 3, 4]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(drain(&mut a).is_empty());
    assert!(drain(&mut b).is_empty());
}

#[tokio::test]
async fn test_broker_outage_degrades_to_local_delivery() {
    let cluster = Cluster::new();
    let east = cluster.hub(HubConfig::default());
    let west = cluster.hub(HubConfig::default());
    let a = connect(&east, "tok-a").await;
    let mut v = connect(&east, "tok-v").await;
    let mut b = connect(&west, "tok-b").await;
    east.subscribe(&a.connection_id, &conv()).await.unwrap();
    east.subscribe(&v.connection_id, &conv()).await.unwrap();
    west.subscribe(&b.connection_id, &conv()).await.unwrap();

    cluster.bus.set_available(false);
    let err = say(&east, &a, "local only").await.unwrap_err();
    assert!(matches!(
        err,
        HubError::BrokerUnavailable {
            event_id: Some(1),
            ..
        }
    ));

    assert_eq!(next_event(&mut v).await.event_id, 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(drain(&mut b).is_empty());

    // Missed events are recoverable from history.
    let history = west
        .recent_history(&b.connection_id, &conv(), None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payload["text"], "local only");
}

#[tokio::test]
async fn test_out_of_order_peer_events_are_reordered() {
    let cluster = Cluster::new();
    let hub = cluster.hub(HubConfig::default());
    let mut b = connect(&hub, "tok-b").await;
    hub.subscribe(&b.connection_id, &conv()).await.unwrap();
    let room = RoomKey::new(acme(), conv());

    let peer = cluster.bus.client();
    let origin = InstanceId::new("peer-1");
    let envelope = |event_id: EventId| {
        let message = BrokerEnvelope {
            origin: origin.clone(),
            event: Event {
                event_id,
                room_id: conv(),
                tenant_id: acme(),
                kind: EventKind::Message,
                produced_by: IdentityId::new("a"),
                payload: json!({ "text": format!("m{event_id}") }),
                produced_at: 0,
            },
        };
        encode_envelope(&message).unwrap()
    };

    let channel = room.channel();
    peer.publish(&channel, envelope(1)).await.unwrap();
    assert_eq!(next_event(&mut b).await.event_id, 1);

    peer.publish(&channel, envelope(3)).await.unwrap();
    peer.publish(&channel, envelope(2)).await.unwrap();
    peer.publish(&channel, envelope(2)).await.unwrap();

    assert_eq!(next_event(&mut b).await.event_id, 2);
    assert_eq!(next_event(&mut b).await.event_id, 3);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(drain(&mut b).is_empty());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let cluster = Cluster::new();
    let hub = cluster.hub(HubConfig::default());
    let mut a = connect(&hub, "tok-a").await;
    let b = connect(&hub, "tok-b").await;
    hub.subscribe(&a.connection_id, &conv()).await.unwrap();
    hub.subscribe(&b.connection_id, &conv()).await.unwrap();

    assert!(hub.unsubscribe(&a.connection_id, &conv()).await.unwrap());
    assert!(!hub.unsubscribe(&a.connection_id, &conv()).await.unwrap());
    say(&hub, &b, "bye").await.unwrap();

    assert!(drain(&mut a).is_empty());
    assert!(hub.joined_rooms(&a.connection_id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_write_is_not_overtaken() {
    let cluster = Cluster::new();
    let hub = cluster.hub_with_store(
        HubConfig::default(),
        SlowWrite::new(cluster.store.clone(), 2, Duration::from_secs(1)),
    );
    let mut a = connect(&hub, "tok-a").await;
    let mut b = connect(&hub, "tok-b").await;
    hub.subscribe(&a.connection_id, &conv()).await.unwrap();
    hub.subscribe(&b.connection_id, &conv()).await.unwrap();
    say(&hub, &a, "first").await.unwrap();

    let (slow, fast) = tokio::join!(say(&hub, &a, "slow"), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        say(&hub, &b, "fast").await
    });
    assert_eq!(slow.unwrap().event_id, 2);
    assert_eq!(fast.unwrap().event_id, 3);

    assert_eq!(drain(&mut a), vec![1, 2, 3]);
    assert_eq!(drain(&mut b), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_write_on_a_peer_is_not_overtaken() {
    let cluster = Cluster::new();
    let east = cluster.hub_with_store(
        HubConfig::default(),
        SlowWrite::new(cluster.store.clone(), 2, Duration::from_secs(2)),
    );
    let west = cluster.hub(HubConfig::default());
    let mut a = connect(&east, "tok-a").await;
    let mut b = connect(&west, "tok-b").await;
    east.subscribe(&a.connection_id, &conv()).await.unwrap();
    west.subscribe(&b.connection_id, &conv()).await.unwrap();
    say(&east, &a, "first").await.unwrap();

    let (slow, fast) = tokio::join!(say(&east, &a, "slow"), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        say(&west, &b, "fast").await
    });
    assert_eq!(slow.unwrap().event_id, 2);
    assert_eq!(fast.unwrap().event_id, 3);

    for session in [&mut a, &mut b] {
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(next_event(session).await.event_id);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(drain(&mut a).is_empty());
    assert!(drain(&mut b).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_first_event_of_a_new_room_survives_reordering() {
    let cluster = Cluster::new();
    let hub = cluster.hub_with_store(
        HubConfig::default(),
        SlowWrite::new(cluster.store.clone(), 1, Duration::from_millis(100)),
    );
    let mut a = connect(&hub, "tok-a").await;
    let mut b = connect(&hub, "tok-b").await;
    hub.subscribe(&a.connection_id, &conv()).await.unwrap();
    hub.subscribe(&b.connection_id, &conv()).await.unwrap();

    let (slow, fast) = tokio::join!(say(&hub, &a, "slow"), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        say(&hub, &b, "fast").await
    });
    assert_eq!(slow.unwrap().event_id, 1);
    assert_eq!(fast.unwrap().event_id, 2);

    assert_eq!(drain(&mut a), vec![1, 2]);
    assert_eq!(drain(&mut b), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_identity_connected_elsewhere_stays_online() {
    let cluster = Cluster::new();
    let east = cluster.hub(HubConfig::default());
    let west = cluster.hub(HubConfig::default());
    let observer = cluster.hub(HubConfig::default());
    let mut b = connect(&east, "tok-b").await;
    east.subscribe(&b.connection_id, &private_room(&IdentityId::new("a")))
        .await
        .unwrap();

    let a_east = connect(&east, "tok-a").await;
    let _a_west = connect(&west, "tok-a").await;
    east.close(&a_east.connection_id, CloseReason::ClientClosed).await;
    tokio::time::sleep(Duration::from_secs(11)).await;

    for hub in [&east, &west, &observer] {
        assert_eq!(
            hub.presence_of(&acme(), &IdentityId::new("a")).await,
            PresenceStatus::Online
        );
    }
    let mut announced = Vec::new();
    while let Ok(event) = b.events.try_recv() {
        announced.push(event.payload["status"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(announced, vec!["online"]);
}

#[tokio::test]
async fn test_peer_event_right_after_subscribe_is_delivered() {
    let cluster = Cluster::new();
    let east = cluster.hub(HubConfig::default());
    let west = cluster.hub(HubConfig::default());
    let a = connect(&east, "tok-a").await;
    let mut b = connect(&west, "tok-b").await;
    east.subscribe(&a.connection_id, &conv()).await.unwrap();
    west.subscribe(&b.connection_id, &conv()).await.unwrap();

    say(&east, &a, "hi").await.unwrap();
    let seen = next_event_within(&mut b, Duration::from_millis(200)).await;
    assert_eq!(seen.event_id, 1);
    assert_eq!(seen.payload["text"], "hi");
}
