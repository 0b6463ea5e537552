//! Room registry.
//!
//! Maps connections to rooms on this instance and owns the per-room delivery
//! state: the local member set, the last delivered event id and the reorder
//! buffer. Every delivery, local or from the broker, goes through the room's
//! entry, so all members see one order.
//!
//! Lock order is room entry first, then the connection's joined set.

use crate::error::HubError;
use crate::room::RoomKey;
use dashmap::DashMap;
use roomcast_protocol::{ConnectionId, Event, EventId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Sending half of a connection's bounded outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Arc<Event>>,
    retired: Arc<AtomicBool>,
}

enum Offer {
    Queued,
    Overflow,
    Skipped,
}

impl Outbox {
    /// Create a queue of `capacity` events.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                retired: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Stop accepting events. Returns `true` on the first call.
    pub fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::SeqCst)
    }

    /// Whether the connection is being torn down.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    /// Events currently waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    // Never waits. A full queue retires the outbox so the owner can be
    // evicted; it is reported once.
    fn offer(&self, event: &Arc<Event>) -> Offer {
        if self.retired.load(Ordering::SeqCst) {
            return Offer::Skipped;
        }
        match self.tx.try_send(Arc::clone(event)) {
            Ok(()) => Offer::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if self.retire() {
                    Offer::Overflow
                } else {
                    Offer::Skipped
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Skipped,
        }
    }
}

/// Result of a subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    /// `false` when the connection already was a member.
    pub newly_joined: bool,
    /// The room had no local members before this call.
    pub first_local: bool,
    /// Local members after the call.
    pub local_members: usize,
}

/// Result of an unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unsubscribed {
    /// The connection was a member.
    pub was_member: bool,
    /// The room has no local members left.
    pub emptied: bool,
}

/// Outcome of handing an event (or a flush) to a room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Events enqueued, summed over members.
    pub delivered: usize,
    /// Members whose queue overflowed during this call.
    pub overflowed: Vec<ConnectionId>,
    /// Events are waiting behind a gap and a flush must be scheduled.
    pub needs_flush: bool,
    /// The event was at or below the room's watermark.
    pub duplicate: bool,
}

struct Pending {
    event: Option<Arc<Event>>,
    since: Instant,
}

struct RoomEntry {
    members: HashMap<ConnectionId, Outbox>,
    watermark: Option<EventId>,
    pending: BTreeMap<EventId, Pending>,
    // Ids reserved by publishes on this instance that are still persisting.
    held: BTreeSet<EventId>,
    flush_armed: bool,
}

impl RoomEntry {
    fn new(watermark: Option<EventId>) -> Self {
        Self {
            members: HashMap::new(),
            watermark,
            pending: BTreeMap::new(),
            held: BTreeSet::new(),
            flush_armed: false,
        }
    }

    fn accept(&mut self, event_id: EventId, event: Option<Arc<Event>>, out: &mut Delivery) {
        self.held.remove(&event_id);
        match self.watermark {
            Some(mark) if event_id <= mark => {
                out.duplicate = true;
                return;
            }
            Some(mark) if event_id > mark + 1 => {
                self.pending.entry(event_id).or_insert(Pending {
                    event,
                    since: Instant::now(),
                });
                if !self.flush_armed {
                    self.flush_armed = true;
                    out.needs_flush = true;
                }
                return;
            }
            _ => {}
        }

        self.emit(event_id, event, out);
        self.drain(out);
    }

    fn emit(&mut self, event_id: EventId, event: Option<Arc<Event>>, out: &mut Delivery) {
        self.watermark = Some(event_id);
        let Some(event) = event else {
            return;
        };
        for (connection, outbox) in &self.members {
            match outbox.offer(&event) {
                Offer::Queued => out.delivered += 1,
                Offer::Overflow => out.overflowed.push(connection.clone()),
                Offer::Skipped => {}
            }
        }
    }

    // Release buffered events that have become contiguous.
    fn drain(&mut self, out: &mut Delivery) {
        while let Some(first) = self.pending.first_entry() {
            let event_id = *first.key();
            match self.watermark {
                Some(mark) if event_id <= mark => {
                    first.remove();
                }
                Some(mark) if event_id == mark + 1 => {
                    let pending = first.remove();
                    self.emit(event_id, pending.event, out);
                }
                _ => break,
            }
        }
    }

    // Whether a gap in front of `event_id` covers an id that is still held.
    fn waits_on_held(&self, event_id: EventId) -> bool {
        match self.watermark {
            Some(mark) if event_id > mark + 1 => {
                self.held.range(mark + 1..event_id).next().is_some()
            }
            _ => false,
        }
    }

    // Give up on gaps in front of events that waited at least `window`,
    // unless a held id sits in the gap.
    fn flush(&mut self, window: Duration, out: &mut Delivery) {
        self.flush_armed = false;
        let now = Instant::now();
        let Some(cutoff) = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.since + window <= now)
            .map(|(event_id, _)| *event_id)
            .max()
        else {
            if !self.pending.is_empty() {
                self.flush_armed = true;
                out.needs_flush = true;
            }
            return;
        };

        while let Some(event_id) = self.pending.keys().next().copied() {
            if event_id > cutoff || self.waits_on_held(event_id) {
                break;
            }
            let Some(pending) = self.pending.remove(&event_id) else {
                break;
            };
            if self.watermark.map_or(true, |mark| event_id > mark) {
                self.emit(event_id, pending.event, out);
            }
        }
        self.drain(out);

        if !self.pending.is_empty() {
            self.flush_armed = true;
            out.needs_flush = true;
        }
    }
}

/// Local room membership and ordered delivery.
pub struct RoomRegistry {
    rooms: DashMap<RoomKey, RoomEntry>,
    joined: DashMap<ConnectionId, HashSet<RoomKey>>,
    max_rooms_per_connection: usize,
    gap_timeout: Duration,
}

impl RoomRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(max_rooms_per_connection: usize, gap_timeout: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            joined: DashMap::new(),
            max_rooms_per_connection,
            gap_timeout,
        }
    }

    /// Add a connection to a room. Idempotent.
    ///
    /// `seed` becomes the watermark if this call creates the room entry: the
    /// latest event id durably written before the room gained local members.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is being closed or has joined too
    /// many rooms.
    pub fn subscribe(
        &self,
        connection: &ConnectionId,
        key: &RoomKey,
        outbox: &Outbox,
        seed: Option<EventId>,
    ) -> Result<Membership, HubError> {
        if outbox.is_retired() {
            return Err(HubError::ConnectionNotFound(connection.clone()));
        }

        let joined_count = self.joined.get(connection).map_or(0, |rooms| {
            if rooms.contains(key) {
                0
            } else {
                rooms.len()
            }
        });
        if joined_count >= self.max_rooms_per_connection {
            return Err(HubError::invalid(format!(
                "connection may join at most {} rooms",
                self.max_rooms_per_connection
            )));
        }

        let mut entry = self.rooms.entry(key.clone()).or_insert_with(|| {
            debug!(room = %key, watermark = ?seed, "Creating room");
            RoomEntry::new(seed)
        });

        let first_local = entry.members.is_empty();
        let newly_joined = entry
            .members
            .insert(connection.clone(), outbox.clone())
            .is_none();
        self.joined
            .entry(connection.clone())
            .or_default()
            .insert(key.clone());

        // A close that started meanwhile has already collected the joined set.
        if outbox.is_retired() {
            entry.members.remove(connection);
            let emptied = entry.members.is_empty();
            drop(entry);
            self.forget_joined(connection, key);
            if emptied {
                self.rooms.remove_if(key, |_, room| room.members.is_empty());
            }
            return Err(HubError::ConnectionNotFound(connection.clone()));
        }

        let local_members = entry.members.len();
        if newly_joined {
            debug!(
                room = %key,
                connection = %connection,
                members = local_members,
                "Subscribed"
            );
        }

        Ok(Membership {
            newly_joined,
            first_local,
            local_members,
        })
    }

    /// Remove a connection from a room.
    pub fn unsubscribe(&self, connection: &ConnectionId, key: &RoomKey) -> Unsubscribed {
        let Some(mut entry) = self.rooms.get_mut(key) else {
            self.forget_joined(connection, key);
            return Unsubscribed::default();
        };

        let was_member = entry.members.remove(connection).is_some();
        let empty = entry.members.is_empty();
        self.forget_joined(connection, key);
        drop(entry);

        let emptied = empty && self.collect(key);
        if was_member {
            debug!(room = %key, connection = %connection, "Unsubscribed");
        }

        Unsubscribed {
            was_member,
            emptied,
        }
    }

    /// Remove a connection from every room. Returns the rooms left without
    /// local members.
    pub fn remove_connection(&self, connection: &ConnectionId) -> Vec<RoomKey> {
        let Some((_, rooms)) = self.joined.remove(connection) else {
            return Vec::new();
        };

        let mut emptied = Vec::new();
        for key in rooms {
            let empty = match self.rooms.get_mut(&key) {
                Some(mut entry) => {
                    entry.members.remove(connection);
                    entry.members.is_empty()
                }
                None => false,
            };
            if empty && self.collect(&key) {
                emptied.push(key);
            }
        }

        debug!(
            connection = %connection,
            emptied = emptied.len(),
            "Removed connection from all rooms"
        );
        emptied
    }

    /// Hand an event to a room's local members, in order.
    pub fn deliver(&self, event: Arc<Event>) -> Delivery {
        let key = RoomKey::new(event.tenant_id.clone(), event.room_id.clone());
        let mut out = Delivery::default();
        let Some(mut entry) = self.rooms.get_mut(&key) else {
            return out;
        };

        let event_id = event.event_id;
        entry.accept(event_id, Some(event), &mut out);
        trace!(
            room = %key,
            event_id,
            delivered = out.delivered,
            duplicate = out.duplicate,
            "Delivered"
        );
        if !out.overflowed.is_empty() {
            warn!(room = %key, overflowed = out.overflowed.len(), "Outbound queues overflowed");
        }
        out
    }

    /// Mark an id reserved by a publish on this instance. A gap covering it
    /// is not given up on until the id is delivered or skipped.
    pub fn hold(&self, key: &RoomKey, event_id: EventId) {
        if let Some(mut entry) = self.rooms.get_mut(key) {
            if entry.watermark.map_or(true, |mark| event_id > mark) {
                entry.held.insert(event_id);
            }
        }
    }

    /// Mark an id that will never be written, so later events do not wait
    /// for it.
    pub fn skip(&self, key: &RoomKey, event_id: EventId) -> Delivery {
        let mut out = Delivery::default();
        if let Some(mut entry) = self.rooms.get_mut(key) {
            if entry.watermark.is_some() {
                entry.accept(event_id, None, &mut out);
            } else {
                entry.held.remove(&event_id);
            }
        }
        out
    }

    /// Release events stuck behind a gap for longer than the gap timeout.
    pub fn flush_pending(&self, key: &RoomKey) -> Delivery {
        let mut out = Delivery::default();
        if let Some(mut entry) = self.rooms.get_mut(key) {
            entry.flush(self.gap_timeout, &mut out);
            if out.delivered > 0 {
                debug!(room = %key, delivered = out.delivered, "Flushed past sequence gap");
            }
        }
        out
    }

    /// Local members of a room.
    #[must_use]
    pub fn members_of(&self, key: &RoomKey) -> Vec<ConnectionId> {
        self.rooms
            .get(key)
            .map(|entry| entry.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a connection is a local member of a room.
    #[must_use]
    pub fn is_member(&self, connection: &ConnectionId, key: &RoomKey) -> bool {
        self.rooms
            .get(key)
            .is_some_and(|entry| entry.members.contains_key(connection))
    }

    /// Number of local members of a room.
    #[must_use]
    pub fn local_member_count(&self, key: &RoomKey) -> usize {
        self.rooms.get(key).map_or(0, |entry| entry.members.len())
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn joined_rooms(&self, connection: &ConnectionId) -> Vec<RoomKey> {
        self.joined
            .get(connection)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last event id delivered in a room.
    #[must_use]
    pub fn watermark(&self, key: &RoomKey) -> Option<EventId> {
        self.rooms.get(key).and_then(|entry| entry.watermark)
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            connection_count: self.joined.len(),
            total_memberships: self.joined.iter().map(|rooms| rooms.len()).sum(),
        }
    }

    fn forget_joined(&self, connection: &ConnectionId, key: &RoomKey) {
        if let Some(mut rooms) = self.joined.get_mut(connection) {
            rooms.remove(key);
        }
        self.joined.remove_if(connection, |_, rooms| rooms.is_empty());
    }

    // Drop a room entry once it has no local members.
    fn collect(&self, key: &RoomKey) -> bool {
        let removed = self
            .rooms
            .remove_if(key, |_, entry| entry.members.is_empty())
            .is_some();
        if removed {
            debug!(room = %key, "Deleted empty room");
        }
        removed
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Rooms with local members.
    pub room_count: usize,
    /// Connections with at least one room.
    pub connection_count: usize,
    /// Total memberships.
    pub total_memberships: usize,
}
