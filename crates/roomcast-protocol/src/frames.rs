//! Frame types for the roomcast protocol.
//!
//! Frames are JSON objects tagged by `type`. Clients send [`ClientFrame`]s and
//! the server answers with [`ServerFrame`]s. Each frame travels as one line.

use crate::event::{Event, EventKind, PresenceStatus};
use crate::ids::{ConnectionId, EventId, IdentityId, RoomId, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Close and error codes used at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure.
    Normal = 1000,
    /// Transient store or broker failure.
    Unavailable = 1011,
    /// Authentication or authorization failure.
    Unauthorized = 4001,
    /// Rate limited or outbound queue overflow.
    Backpressure = 4002,
    /// The frame could not be parsed or is not valid here.
    MalformedFrame = 4003,
}

impl CloseCode {
    /// Numeric value of the code.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for CloseCode {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1000 => Ok(CloseCode::Normal),
            1011 => Ok(CloseCode::Unavailable),
            4001 => Ok(CloseCode::Unauthorized),
            4002 => Ok(CloseCode::Backpressure),
            4003 => Ok(CloseCode::MalformedFrame),
            _ => Err("Invalid close code"),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Handshake carrying credentials.
    Connect {
        /// Opaque authentication token.
        token: String,
        /// Tenant the client claims to belong to.
        tenant: TenantId,
        /// Client protocol version as `major.minor`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },

    /// Join a room.
    Subscribe {
        /// Room to join.
        room_id: RoomId,
        /// Optional request ID echoed in the acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Leave a room.
    Unsubscribe {
        /// Room to leave.
        room_id: RoomId,
        /// Optional request ID.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Send a chat message.
    Message {
        /// Target room.
        room_id: RoomId,
        /// Message body, e.g. `{"text": "hi"}`.
        payload: serde_json::Value,
        /// Optional request ID.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Typing started.
    TypingStart {
        /// Target room.
        room_id: RoomId,
        /// Optional body.
        #[serde(default)]
        payload: serde_json::Value,
        /// Optional request ID.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Typing stopped.
    TypingStop {
        /// Target room.
        room_id: RoomId,
        /// Optional body.
        #[serde(default)]
        payload: serde_json::Value,
        /// Optional request ID.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Room state change (assignment, closure, ...).
    RoomState {
        /// Target room.
        room_id: RoomId,
        /// New state.
        payload: serde_json::Value,
        /// Optional request ID.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Explicit presence status change.
    Status {
        /// Requested status.
        status: PresenceStatus,
        /// Optional request ID.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Request recent history of a room.
    History {
        /// Room to replay.
        room_id: RoomId,
        /// Maximum number of events.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        /// Optional request ID.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Application-level keepalive.
    Ping {
        /// Optional timestamp echoed in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Wire name of the frame type.
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            ClientFrame::Connect { .. } => "connect",
            ClientFrame::Subscribe { .. } => "subscribe",
            ClientFrame::Unsubscribe { .. } => "unsubscribe",
            ClientFrame::Message { .. } => "message",
            ClientFrame::TypingStart { .. } => "typingStart",
            ClientFrame::TypingStop { .. } => "typingStop",
            ClientFrame::RoomState { .. } => "roomState",
            ClientFrame::Status { .. } => "status",
            ClientFrame::History { .. } => "history",
            ClientFrame::Ping { .. } => "ping",
        }
    }

    /// The event kind this frame publishes, if any.
    #[must_use]
    pub fn event_kind(&self) -> Option<EventKind> {
        match self {
            ClientFrame::Message { .. } => Some(EventKind::Message),
            ClientFrame::TypingStart { .. } => Some(EventKind::TypingStart),
            ClientFrame::TypingStop { .. } => Some(EventKind::TypingStop),
            ClientFrame::RoomState { .. } => Some(EventKind::RoomStateChanged),
            _ => None,
        }
    }

    /// Create a Connect frame.
    #[must_use]
    pub fn connect(token: impl Into<String>, tenant: impl Into<TenantId>) -> Self {
        ClientFrame::Connect {
            token: token.into(),
            tenant: tenant.into(),
            version: None,
        }
    }

    /// Create a Subscribe frame.
    #[must_use]
    pub fn subscribe(room_id: impl Into<RoomId>) -> Self {
        ClientFrame::Subscribe {
            room_id: room_id.into(),
            id: None,
        }
    }

    /// Create a Message frame.
    #[must_use]
    pub fn message(room_id: impl Into<RoomId>, payload: serde_json::Value) -> Self {
        ClientFrame::Message {
            room_id: room_id.into(),
            payload,
            id: None,
        }
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Handshake accepted.
    Connected {
        /// Connection identifier assigned by the hub.
        connection_id: ConnectionId,
        /// Resolved identity.
        identity_id: IdentityId,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat_ms: u64,
        /// Negotiated protocol version.
        version: String,
    },

    /// A room event.
    Event {
        /// The sequenced event.
        event: Event,
    },

    /// Acknowledgment of a request.
    Ack {
        /// Request ID, if the client supplied one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Room the request targeted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        /// Sequence number assigned to a published event.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<EventId>,
    },

    /// Recent history of a room, oldest first.
    History {
        /// Request ID, if supplied.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Room replayed.
        room_id: RoomId,
        /// Events in ascending `eventId` order.
        events: Vec<Event>,
    },

    /// Error response.
    Error {
        /// ID of the failed request, if supplied.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Error code.
        code: CloseCode,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive pong.
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerFrame {
    /// Wire name of the frame type.
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::Event { .. } => "event",
            ServerFrame::Ack { .. } => "ack",
            ServerFrame::History { .. } => "history",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Pong { .. } => "pong",
        }
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: Option<u64>) -> Self {
        ServerFrame::Ack {
            id,
            room_id: None,
            event_id: None,
        }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: Option<u64>, code: CloseCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            id,
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_from_wire() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "message",
            "roomId": "conv-1",
            "payload": {"text": "hi"}
        }))
        .unwrap();

        assert_eq!(frame.frame_type(), "message");
        assert_eq!(frame.event_kind(), Some(EventKind::Message));
        assert_eq!(
            frame,
            ClientFrame::message("conv-1", json!({"text": "hi"}))
        );
    }

    #[test]
    fn test_typing_frame_payload_is_optional() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "typingStart", "roomId": "conv-1"})).unwrap();
        assert_eq!(frame.event_kind(), Some(EventKind::TypingStart));
    }

    #[test]
    fn test_error_frame_wire_shape() {
        let frame = ServerFrame::error(None, CloseCode::Unauthorized, "not a member");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({"type": "error", "code": 4001, "message": "not a member"}));
    }

    #[test]
    fn test_close_code_conversion() {
        assert_eq!(CloseCode::try_from(4002), Ok(CloseCode::Backpressure));
        assert_eq!(CloseCode::Normal.as_u16(), 1000);
        assert!(CloseCode::try_from(4999).is_err());
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        let result: Result<ClientFrame, _> =
            serde_json::from_value(json!({"type": "teleport", "roomId": "x"}));
        assert!(result.is_err());
    }
}
