//! Identifier types shared by every roomcast crate.
//!
//! All identifiers are opaque strings on the wire. Event identifiers are the
//! exception: they are plain `u64` sequence numbers scoped to a room.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-room event sequence number.
pub type EventId = u64;

/// Atomic counter so generated ids stay unique within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_suffix() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}{:04x}", timestamp, counter & 0xffff)
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// A tenant (organization) identifier.
    TenantId
);

string_id!(
    /// A participant identifier, independent of any single connection.
    IdentityId
);

string_id!(
    /// A room identifier, unique within a tenant.
    RoomId
);

string_id!(
    /// A live transport session identifier.
    ConnectionId
);

string_id!(
    /// Identifies one running hub process.
    InstanceId
);

impl ConnectionId {
    /// Generate a connection ID unique within this process.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", unique_suffix()))
    }
}

impl InstanceId {
    /// Generate an instance ID from the host name and a unique suffix.
    #[must_use]
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self(format!("{}-{}", host, unique_suffix()))
    }
}

impl IdentityId {
    /// The identity used for events produced by the hub itself.
    #[must_use]
    pub fn system() -> Self {
        Self("system".to_string())
    }
}
