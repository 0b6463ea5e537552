//! Room addressing.
//!
//! Rooms are tenant-scoped: `conv-1` of tenant `acme` and `conv-1` of tenant
//! `globex` are unrelated. A [`RoomKey`] carries both halves.

use roomcast_protocol::{IdentityId, RoomId, TenantId};
use std::fmt;

/// Maximum room id length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// Room id of a tenant's broadcast room.
pub const BROADCAST_ROOM: &str = "broadcast";

/// Prefix of identity-private room ids.
pub const PRIVATE_ROOM_PREFIX: &str = "identity:";

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the room id is invalid.
pub fn validate_room_id(room_id: &RoomId) -> Result<(), &'static str> {
    let name = room_id.as_str();
    if name.is_empty() {
        return Err("Room id cannot be empty");
    }
    if name.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if name.starts_with('$') {
        return Err("Room ids starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room id contains invalid characters");
    }
    if name == PRIVATE_ROOM_PREFIX {
        return Err("Private room id is missing its identity");
    }
    Ok(())
}

/// What a room groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKind {
    /// A conversation between visitors and agents.
    Conversation,
    /// The tenant-wide channel.
    TenantBroadcast,
    /// A single identity's private channel.
    IdentityPrivate(IdentityId),
}

impl RoomKind {
    /// Derive the kind from a room id.
    #[must_use]
    pub fn of(room_id: &RoomId) -> Self {
        let name = room_id.as_str();
        if name == BROADCAST_ROOM {
            RoomKind::TenantBroadcast
        } else if let Some(identity) = name.strip_prefix(PRIVATE_ROOM_PREFIX) {
            RoomKind::IdentityPrivate(IdentityId::new(identity))
        } else {
            RoomKind::Conversation
        }
    }
}

/// Room id of an identity's private room.
#[must_use]
pub fn private_room(identity: &IdentityId) -> RoomId {
    RoomId::new(format!("{PRIVATE_ROOM_PREFIX}{identity}"))
}

/// Room id of the tenant broadcast room.
#[must_use]
pub fn broadcast_room() -> RoomId {
    RoomId::new(BROADCAST_ROOM)
}

/// A tenant-scoped room address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Room within the tenant.
    pub room: RoomId,
}

impl RoomKey {
    /// Create a room key.
    #[must_use]
    pub fn new(tenant: impl Into<TenantId>, room: impl Into<RoomId>) -> Self {
        Self {
            tenant: tenant.into(),
            room: room.into(),
        }
    }

    /// Kind of the room.
    #[must_use]
    pub fn kind(&self) -> RoomKind {
        RoomKind::of(&self.room)
    }

    /// Broker channel carrying this room's events across instances.
    ///
    /// `%` and `:` are percent-escaped in both halves, so distinct keys never
    /// share a channel.
    #[must_use]
    pub fn channel(&self) -> String {
        format!(
            "room:{}:{}",
            escape_channel_part(self.tenant.as_str()),
            escape_channel_part(self.room.as_str())
        )
    }
}

fn escape_channel_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            c => escaped.push(c),
        }
    }
    escaped
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.room)
    }
}
