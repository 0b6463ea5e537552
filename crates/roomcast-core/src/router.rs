//! Event router.
//!
//! Validates and sequences events, persists them, delivers them to local
//! members and publishes them to peer instances. One feed task per room with
//! local members brings peer events back in.

use crate::config::HubConfig;
use crate::error::HubError;
use crate::identity::Identity;
use crate::ports::{Broker, BrokerStream, EventStore};
use crate::registry::{Delivery, RoomRegistry};
use crate::room::{validate_room_id, RoomKey};
use dashmap::DashMap;
use futures_util::StreamExt;
use roomcast_protocol::codec::{decode_envelope, encode_envelope};
use roomcast_protocol::{
    now_millis, BrokerEnvelope, ConnectionId, Event, EventId, EventKind, IdentityId, InstanceId,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Who is publishing.
#[derive(Debug, Clone)]
pub enum Producer {
    /// A client connection. Must be a member of the room.
    Connection {
        /// Publishing connection.
        connection: ConnectionId,
        /// Its identity.
        identity: Identity,
    },
    /// A trusted server-side producer. Skips membership checks.
    System(Identity),
}

impl Producer {
    /// Identity the event is attributed to.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        match self {
            Producer::Connection { identity, .. } | Producer::System(identity) => identity,
        }
    }
}

/// A request to publish one event.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Target room.
    pub room: RoomKey,
    /// Producer of the event.
    pub producer: Producer,
    /// Event kind.
    pub kind: EventKind,
    /// Kind-specific body.
    pub payload: Value,
}

/// Hands events to the registry and acts on the outcome: overflowed
/// connections are queued for eviction and gaps get a flush timer.
#[derive(Clone)]
struct Dispatcher {
    registry: Arc<RoomRegistry>,
    evictions: mpsc::UnboundedSender<ConnectionId>,
    gap_timeout: Duration,
}

impl Dispatcher {
    fn deliver(&self, event: Arc<Event>) -> Delivery {
        let key = RoomKey::new(event.tenant_id.clone(), event.room_id.clone());
        let delivery = self.registry.deliver(event);
        self.settle(&key, &delivery);
        delivery
    }

    fn skip(&self, key: &RoomKey, event_id: EventId) {
        let delivery = self.registry.skip(key, event_id);
        self.settle(key, &delivery);
    }

    fn settle(&self, key: &RoomKey, delivery: &Delivery) {
        for connection in &delivery.overflowed {
            if self.evictions.send(connection.clone()).is_err() {
                debug!(connection = %connection, "Eviction loop gone");
            }
        }

        if delivery.needs_flush {
            let Ok(runtime) = Handle::try_current() else {
                debug!(room = %key, "No runtime left to schedule a flush");
                return;
            };
            let dispatcher = self.clone();
            let key = key.clone();
            runtime.spawn(async move {
                tokio::time::sleep(dispatcher.gap_timeout).await;
                let flushed = dispatcher.registry.flush_pending(&key);
                dispatcher.settle(&key, &flushed);
            });
        }
    }
}

/// An event id reserved for a publish in progress.
///
/// Holds the id in the room's delivery order until the event is delivered.
/// Dropped unsettled, the id is skipped so later events stop waiting on it.
struct Reservation {
    dispatcher: Dispatcher,
    room: RoomKey,
    event_id: EventId,
    settled: bool,
}

impl Reservation {
    fn new(dispatcher: &Dispatcher, room: &RoomKey, event_id: EventId) -> Self {
        dispatcher.registry.hold(room, event_id);
        Self {
            dispatcher: dispatcher.clone(),
            room: room.clone(),
            event_id,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            debug!(room = %self.room, event_id = self.event_id, "Skipping burned event id");
            self.dispatcher.skip(&self.room, self.event_id);
        }
    }
}

struct Feed {
    task: JoinHandle<()>,
}

/// Publishes events and keeps broker feeds in step with local membership.
pub struct EventRouter {
    dispatcher: Dispatcher,
    store: Arc<dyn EventStore>,
    broker: Arc<dyn Broker>,
    config: HubConfig,
    feeds: DashMap<RoomKey, Arc<Mutex<Option<Feed>>>>,
}

impl EventRouter {
    /// Create a router. Overflowed connections are sent on `evictions`.
    #[must_use]
    pub fn new(
        registry: Arc<RoomRegistry>,
        store: Arc<dyn EventStore>,
        broker: Arc<dyn Broker>,
        config: HubConfig,
        evictions: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher {
                registry,
                evictions,
                gap_timeout: config.gap_timeout(),
            },
            store,
            broker,
            config,
            feeds: DashMap::new(),
        }
    }

    /// Validate, sequence, persist, deliver and publish one event.
    ///
    /// Nothing is delivered unless the store confirmed the write. A broker
    /// failure is reported as [`HubError::BrokerUnavailable`] carrying the
    /// event id: the event is committed and was delivered on this instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is rejected, persistence fails or
    /// times out, or the broker refuses the publish.
    pub async fn publish(&self, request: PublishRequest) -> Result<Arc<Event>, HubError> {
        self.validate(&request)?;

        let PublishRequest {
            room,
            producer,
            kind,
            payload,
        } = request;
        let produced_by = producer.identity().identity_id.clone();

        let mut reserved = None;
        let persisted = timeout(
            self.config.persistence_timeout,
            self.persist(&room, kind, produced_by, payload, &mut reserved),
        )
        .await;

        // Dropping an unsettled reservation skips its id.
        let event = match persisted {
            Ok(Ok(event)) => Arc::new(event),
            Ok(Err(err)) => {
                drop(reserved);
                warn!(room = %room, error = %err, "Persisting event failed");
                return Err(err);
            }
            Err(_) => {
                drop(reserved);
                warn!(
                    room = %room,
                    timeout = ?self.config.persistence_timeout,
                    "Persisting event timed out"
                );
                return Err(HubError::PersistenceTimeout(self.config.persistence_timeout));
            }
        };

        let delivery = self.dispatcher.deliver(Arc::clone(&event));
        if let Some(reservation) = reserved {
            reservation.settle();
        }
        trace!(
            room = %room,
            event_id = event.event_id,
            kind = %event.kind,
            local = delivery.delivered,
            "Published locally"
        );

        self.fan_out(&room, &event).await?;
        Ok(event)
    }

    /// Recent non-ephemeral events of a room, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or does not answer in time.
    pub async fn recent_history(
        &self,
        room: &RoomKey,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, HubError> {
        validate_room_id(&room.room).map_err(HubError::invalid)?;
        let limit = limit
            .unwrap_or(self.config.history_limit)
            .min(self.config.history_limit);

        match timeout(
            self.config.persistence_timeout,
            self.store.read_recent_events(room, limit),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(HubError::PersistenceTimeout(self.config.persistence_timeout)),
        }
    }

    /// Latest durably written event id of a room, `Some(0)` for a room that
    /// was never written. Store failures read as unknown.
    pub async fn latest_event_id(&self, room: &RoomKey) -> Option<EventId> {
        match timeout(
            self.config.persistence_timeout,
            self.store.latest_event_id(room),
        )
        .await
        {
            Ok(Ok(latest)) => Some(latest.unwrap_or(0)),
            Ok(Err(err)) => {
                warn!(room = %room, error = %err, "Reading latest event id failed");
                None
            }
            Err(_) => {
                warn!(room = %room, "Reading latest event id timed out");
                None
            }
        }
    }

    /// Start or stop the room's broker feed to match its local membership.
    ///
    /// A started feed is subscribed on the broker before this returns. If the
    /// broker refuses, the feed keeps retrying in the background.
    pub async fn sync_feed(&self, room: &RoomKey) {
        let slot = Arc::clone(self.feeds.entry(room.clone()).or_default().value());
        {
            let mut feed = slot.lock().await;
            let wanted = self.dispatcher.registry.local_member_count(room) > 0;

            if wanted && feed.is_none() {
                *feed = Some(self.start_feed(room.clone()).await);
            } else if !wanted {
                if let Some(stopped) = feed.take() {
                    self.stop_feed(room, stopped).await;
                }
            }
        }
        drop(slot);

        self.feeds.remove_if(room, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|feed| feed.is_none())
        });
    }

    /// Stop every broker feed.
    pub async fn shutdown(&self) {
        let rooms: Vec<RoomKey> = self.feeds.iter().map(|entry| entry.key().clone()).collect();
        for room in rooms {
            let Some(slot) = self.feeds.get(&room).map(|entry| Arc::clone(entry.value())) else {
                continue;
            };
            let stopped = slot.lock().await.take();
            if let Some(stopped) = stopped {
                self.stop_feed(&room, stopped).await;
            }
        }
        self.feeds.clear();
        info!("Event router stopped");
    }

    /// Number of rooms with a running broker feed.
    #[must_use]
    pub fn active_feeds(&self) -> usize {
        self.feeds
            .iter()
            .filter(|entry| entry.value().try_lock().map_or(true, |feed| feed.is_some()))
            .count()
    }

    fn validate(&self, request: &PublishRequest) -> Result<(), HubError> {
        let room = &request.room;
        validate_room_id(&room.room).map_err(HubError::invalid)?;

        let identity = request.producer.identity();
        if identity.tenant_id != room.tenant {
            return Err(HubError::unauthorized(format!(
                "identity {} does not belong to tenant {}",
                identity.identity_id, room.tenant
            )));
        }

        validate_payload(request.kind, &request.payload)?;

        let size = serde_json::to_vec(&request.payload)
            .map_err(|err| HubError::invalid(format!("payload is not serializable: {err}")))?
            .len();
        if size > self.config.max_payload_bytes {
            return Err(HubError::invalid(format!(
                "payload is {size} bytes, limit is {}",
                self.config.max_payload_bytes
            )));
        }

        match &request.producer {
            Producer::System(_) => Ok(()),
            Producer::Connection { .. } if request.kind == EventKind::PresenceChanged => Err(
                HubError::unauthorized("presence events are produced by the hub"),
            ),
            Producer::Connection { connection, .. } => {
                if self.dispatcher.registry.is_member(connection, room) {
                    Ok(())
                } else {
                    Err(HubError::unauthorized(format!("not a member of {}", room.room)))
                }
            }
        }
    }

    async fn persist(
        &self,
        room: &RoomKey,
        kind: EventKind,
        produced_by: IdentityId,
        payload: Value,
        reserved: &mut Option<Reservation>,
    ) -> Result<Event, HubError> {
        let event_id = self.store.reserve_next_event_id(room).await?;
        *reserved = Some(Reservation::new(&self.dispatcher, room, event_id));

        let event = Event {
            event_id,
            room_id: room.room.clone(),
            tenant_id: room.tenant.clone(),
            kind,
            produced_by,
            payload,
            produced_at: now_millis(),
        };
        let ttl = kind.is_ephemeral().then_some(self.config.ephemeral_ttl);
        self.store.write_event(&event, ttl).await?;
        Ok(event)
    }

    async fn fan_out(&self, room: &RoomKey, event: &Arc<Event>) -> Result<(), HubError> {
        let unavailable = |detail: String| HubError::BrokerUnavailable {
            event_id: Some(event.event_id),
            detail,
        };

        let envelope = BrokerEnvelope {
            origin: self.config.instance_id.clone(),
            event: Event::clone(event),
        };
        let bytes = encode_envelope(&envelope).map_err(|err| unavailable(err.to_string()))?;

        match timeout(
            self.config.broker_timeout,
            self.broker.publish(&room.channel(), bytes),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(
                    room = %room,
                    event_id = event.event_id,
                    error = %err,
                    "Broker publish failed, event delivered locally only"
                );
                Err(unavailable(err.to_string()))
            }
            Err(_) => {
                warn!(
                    room = %room,
                    event_id = event.event_id,
                    "Broker publish timed out, event delivered locally only"
                );
                Err(unavailable("broker publish timed out".into()))
            }
        }
    }

    async fn start_feed(&self, room: RoomKey) -> Feed {
        let attached = match timeout(
            self.config.broker_timeout,
            self.broker.subscribe(&room.channel()),
        )
        .await
        {
            Ok(Ok(stream)) => {
                debug!(room = %room, "Broker feed attached");
                Some(stream)
            }
            Ok(Err(err)) => {
                warn!(
                    room = %room,
                    error = %err,
                    "Broker subscribe failed, retrying in background"
                );
                None
            }
            Err(_) => {
                warn!(room = %room, "Broker subscribe timed out, retrying in background");
                None
            }
        };

        let task = tokio::spawn(run_feed(
            room,
            attached,
            self.dispatcher.clone(),
            Arc::clone(&self.broker),
            self.config.instance_id.clone(),
            self.config.broker_timeout,
            self.config.broker_retry_backoff,
        ));
        Feed { task }
    }

    async fn stop_feed(&self, room: &RoomKey, feed: Feed) {
        feed.task.abort();
        let _ = feed.task.await;

        match timeout(
            self.config.broker_timeout,
            self.broker.unsubscribe(&room.channel()),
        )
        .await
        {
            Ok(Ok(())) => debug!(room = %room, "Broker feed stopped"),
            Ok(Err(err)) => warn!(room = %room, error = %err, "Broker unsubscribe failed"),
            Err(_) => warn!(room = %room, "Broker unsubscribe timed out"),
        }
    }
}

/// Check a payload against its event kind.
///
/// # Errors
///
/// Returns an invalid-request rejection describing the problem.
pub fn validate_payload(kind: EventKind, payload: &Value) -> Result<(), HubError> {
    match kind {
        EventKind::Message => match payload.get("text").and_then(Value::as_str) {
            Some(text) if !text.trim().is_empty() => Ok(()),
            Some(_) => Err(HubError::invalid("message text cannot be empty")),
            None => Err(HubError::invalid("message payload needs a text field")),
        },
        EventKind::TypingStart | EventKind::TypingStop => {
            if payload.is_null() || payload.is_object() {
                Ok(())
            } else {
                Err(HubError::invalid("typing payload must be an object"))
            }
        }
        EventKind::RoomStateChanged | EventKind::PresenceChanged => {
            if payload.is_object() {
                Ok(())
            } else {
                Err(HubError::invalid(format!("{kind} payload must be an object")))
            }
        }
    }
}

// Delivers peer events until aborted, resubscribing with backoff whenever the
// stream is missing or ends.
async fn run_feed(
    room: RoomKey,
    mut attached: Option<BrokerStream>,
    dispatcher: Dispatcher,
    broker: Arc<dyn Broker>,
    instance_id: InstanceId,
    broker_timeout: Duration,
    backoff: Duration,
) {
    let channel = room.channel();
    loop {
        let mut stream = match attached.take() {
            Some(stream) => stream,
            None => {
                tokio::time::sleep(backoff).await;
                match timeout(broker_timeout, broker.subscribe(&channel)).await {
                    Ok(Ok(stream)) => {
                        debug!(room = %room, "Broker feed attached");
                        stream
                    }
                    Ok(Err(err)) => {
                        warn!(room = %room, error = %err, "Broker subscribe failed, retrying");
                        continue;
                    }
                    Err(_) => {
                        warn!(room = %room, "Broker subscribe timed out, retrying");
                        continue;
                    }
                }
            }
        };

        while let Some(bytes) = stream.next().await {
            let envelope = match decode_envelope(&bytes) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(room = %room, error = %err, "Dropping undecodable broker message");
                    continue;
                }
            };

            // Our own events were delivered before they were published.
            if envelope.origin == instance_id {
                continue;
            }

            let event = envelope.event;
            if event.tenant_id != room.tenant || event.room_id != room.room {
                warn!(
                    room = %room,
                    event_room = %event.room_id,
                    event_tenant = %event.tenant_id,
                    "Dropping broker message for another room"
                );
                continue;
            }

            let event_id = event.event_id;
            let delivery = dispatcher.deliver(Arc::new(event));
            trace!(
                room = %room,
                event_id,
                origin = %envelope.origin,
                delivered = delivery.delivered,
                duplicate = delivery.duplicate,
                "Delivered peer event"
            );
        }

        warn!(room = %room, "Broker feed ended, resubscribing");
    }
}
