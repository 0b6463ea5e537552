//! The event record: the unit of sequencing, persistence and delivery.

use crate::ids::{EventId, IdentityId, RoomId, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Kinds of events carried through a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// A chat message.
    Message,
    /// A participant started typing.
    TypingStart,
    /// A participant stopped typing.
    TypingStop,
    /// An identity's presence status changed.
    PresenceChanged,
    /// Room-level state changed (assignment, closure, ...).
    RoomStateChanged,
}

impl EventKind {
    /// Ephemeral events are stored with a short TTL and never replayed.
    #[must_use]
    pub fn is_ephemeral(self) -> bool {
        matches!(
            self,
            EventKind::TypingStart | EventKind::TypingStop | EventKind::PresenceChanged
        )
    }

    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::TypingStart => "typingStart",
            EventKind::TypingStop => "typingStop",
            EventKind::PresenceChanged => "presenceChanged",
            EventKind::RoomStateChanged => "roomStateChanged",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence status of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// At least one live connection.
    Online,
    /// Connected but explicitly marked away by the client.
    Away,
    /// No live connection, or the presence entry expired.
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        })
    }
}

/// The kind of participant behind an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    /// An authenticated support agent or operator.
    Agent,
    /// An anonymous visitor.
    Visitor,
    /// The hub itself or a trusted backend.
    System,
}

/// An immutable, sequenced fact delivered to room subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Monotonic sequence number within the room.
    pub event_id: EventId,
    /// Room the event belongs to.
    pub room_id: RoomId,
    /// Tenant owning the room.
    pub tenant_id: TenantId,
    /// Event kind.
    pub kind: EventKind,
    /// Identity that produced the event.
    pub produced_by: IdentityId,
    /// Kind-specific body.
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub produced_at: u64,
}

impl Event {
    /// Whether the event is excluded from history replay.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.kind.is_ephemeral()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let event = Event {
            event_id: 1,
            room_id: RoomId::new("conv-1"),
            tenant_id: TenantId::new("acme"),
            kind: EventKind::Message,
            produced_by: IdentityId::new("agent-a"),
            payload: json!({"text": "hi"}),
            produced_at: 1_700_000_000_000,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventId"], 1);
        assert_eq!(value["roomId"], "conv-1");
        assert_eq!(value["kind"], "message");
        assert_eq!(value["payload"]["text"], "hi");
    }

    #[test]
    fn test_ephemeral_kinds() {
        assert!(EventKind::TypingStart.is_ephemeral());
        assert!(EventKind::TypingStop.is_ephemeral());
        assert!(EventKind::PresenceChanged.is_ephemeral());
        assert!(!EventKind::Message.is_ephemeral());
        assert!(!EventKind::RoomStateChanged.is_ephemeral());
    }

    #[test]
    fn test_presence_status_serialization() {
        assert_eq!(
            serde_json::to_string(&PresenceStatus::Offline).unwrap(),
            "\"offline\""
        );
        assert_eq!(PresenceStatus::Away.to_string(), "away");
    }
}
