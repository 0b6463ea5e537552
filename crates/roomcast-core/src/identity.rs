//! Identities and stored presence records.

use roomcast_protocol::{IdentityId, IdentityKind, InstanceId, PresenceStatus, TenantId};
use serde::{Deserialize, Serialize};

/// A participant. Looked up, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Identity identifier.
    pub identity_id: IdentityId,
    /// Kind of participant.
    pub kind: IdentityKind,
    /// Owning tenant.
    pub tenant_id: TenantId,
}

impl Identity {
    /// Create an identity.
    #[must_use]
    pub fn new(
        identity_id: impl Into<IdentityId>,
        kind: IdentityKind,
        tenant_id: impl Into<TenantId>,
    ) -> Self {
        Self {
            identity_id: identity_id.into(),
            kind,
            tenant_id: tenant_id.into(),
        }
    }

    /// Create an agent identity.
    #[must_use]
    pub fn agent(identity_id: impl Into<IdentityId>, tenant_id: impl Into<TenantId>) -> Self {
        Self::new(identity_id, IdentityKind::Agent, tenant_id)
    }

    /// Create a visitor identity.
    #[must_use]
    pub fn visitor(identity_id: impl Into<IdentityId>, tenant_id: impl Into<TenantId>) -> Self {
        Self::new(identity_id, IdentityKind::Visitor, tenant_id)
    }

    /// The hub's own identity within a tenant.
    #[must_use]
    pub fn system(tenant_id: impl Into<TenantId>) -> Self {
        Self::new(IdentityId::system(), IdentityKind::System, tenant_id)
    }

    /// Agents and system identities may watch tenant-wide rooms.
    #[must_use]
    pub fn is_privileged(&self) -> bool {
        matches!(self.kind, IdentityKind::Agent | IdentityKind::System)
    }
}

/// Presence of one identity as reported by one hub instance.
///
/// An identity connected to several instances has one record per instance.
/// Its overall status is the liveliest unexpired one, see
/// [`PresenceRecord::liveliest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Identity described.
    pub identity_id: IdentityId,
    /// Instance holding the identity's connections.
    pub instance_id: InstanceId,
    /// Last observed status.
    pub status: PresenceStatus,
    /// Milliseconds since the Unix epoch after which the record reads as offline.
    pub expires_at: u64,
}

impl PresenceRecord {
    /// Status as of `now_ms`, honoring expiry.
    #[must_use]
    pub fn status_at(&self, now_ms: u64) -> PresenceStatus {
        if self.status != PresenceStatus::Offline && self.expires_at < now_ms {
            PresenceStatus::Offline
        } else {
            self.status
        }
    }

    /// The record deciding an identity's overall status as of `now_ms`.
    ///
    /// `online` on any instance beats `away`, which beats `offline`. Among
    /// equals the record written last wins.
    pub fn liveliest<'a>(
        records: impl IntoIterator<Item = &'a PresenceRecord>,
        now_ms: u64,
    ) -> Option<&'a PresenceRecord> {
        records
            .into_iter()
            .max_by_key(|record| (rank(record.status_at(now_ms)), record.expires_at))
    }
}

fn rank(status: PresenceStatus) -> u8 {
    match status {
        PresenceStatus::Offline => 0,
        PresenceStatus::Away => 1,
        PresenceStatus::Online => 2,
    }
}
