//! Error taxonomy for the hub.
//!
//! Port adapters report [`StoreError`] and [`BrokerError`]; the authenticator
//! reports [`AuthError`]. Every hub operation surfaces a [`HubError`], which
//! knows the code it maps to at the transport boundary.

use roomcast_protocol::{CloseCode, ConnectionId, EventId};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a publish or subscribe request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The producer may not act on this room.
    Unauthorized,
    /// The request failed validation.
    Invalid,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::Unauthorized => "unauthorized",
            RejectReason::Invalid => "invalid",
        })
    }
}

/// Authentication failures. Terminal for the connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The token is unknown or malformed.
    #[error("invalid token")]
    InvalidToken,

    /// The token has expired.
    #[error("token expired")]
    Expired,

    /// The identity does not belong to the claimed tenant.
    #[error("tenant claim does not match identity")]
    TenantMismatch,

    /// The auth collaborator did not answer in time.
    #[error("auth lookup timed out")]
    Timeout,

    /// The auth collaborator is unreachable.
    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

/// Persistence port failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store cannot be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A conditional write lost a race.
    #[error("store conflict: {0}")]
    Conflict(String),
}

/// Broker port failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker cannot be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by hub operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// Handshake failed; no connection was created.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The request was refused without side effects.
    #[error("rejected ({reason}): {detail}")]
    Rejected {
        /// Rejection category.
        reason: RejectReason,
        /// Human-readable detail.
        detail: String,
    },

    /// The store did not confirm the write in time. Nothing was broadcast.
    #[error("persistence timed out after {0:?}")]
    PersistenceTimeout(Duration),

    /// The store refused the operation. Nothing was broadcast.
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    /// The broker refused the publish. When `event_id` is set the event was
    /// persisted and delivered on this instance only.
    #[error("broker unavailable: {detail}")]
    BrokerUnavailable {
        /// Sequence number of the committed event, if any.
        event_id: Option<EventId>,
        /// Human-readable detail.
        detail: String,
    },

    /// The connection's outbound queue overflowed and it was closed.
    #[error("connection {0} closed: outbound queue full")]
    Backpressure(ConnectionId),

    /// The connection is unknown or already closed.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),
}

impl HubError {
    /// Create an unauthorized rejection.
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        HubError::Rejected {
            reason: RejectReason::Unauthorized,
            detail: detail.into(),
        }
    }

    /// Create an invalid-request rejection.
    pub fn invalid(detail: impl Into<String>) -> Self {
        HubError::Rejected {
            reason: RejectReason::Invalid,
            detail: detail.into(),
        }
    }

    /// The rejection reason, if this is a rejection.
    #[must_use]
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            HubError::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether a caller may retry the same operation later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HubError::PersistenceTimeout(_)
                | HubError::Persistence(_)
                | HubError::BrokerUnavailable { .. }
                | HubError::Auth(AuthError::Timeout | AuthError::Unavailable(_))
        )
    }

    /// Code reported to the client for this error.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            HubError::Auth(AuthError::Timeout | AuthError::Unavailable(_)) => {
                CloseCode::Unavailable
            }
            HubError::Auth(_) => CloseCode::Unauthorized,
            HubError::Rejected {
                reason: RejectReason::Unauthorized,
                ..
            } => CloseCode::Unauthorized,
            HubError::Rejected {
                reason: RejectReason::Invalid,
                ..
            } => CloseCode::MalformedFrame,
            HubError::PersistenceTimeout(_)
            | HubError::Persistence(_)
            | HubError::BrokerUnavailable { .. } => CloseCode::Unavailable,
            HubError::Backpressure(_) => CloseCode::Backpressure,
            HubError::ConnectionNotFound(_) => CloseCode::Normal,
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::Auth(_) => "auth",
            HubError::Rejected { .. } => "rejected",
            HubError::PersistenceTimeout(_) => "persistence_timeout",
            HubError::Persistence(_) => "persistence",
            HubError::BrokerUnavailable { .. } => "broker_unavailable",
            HubError::Backpressure(_) => "backpressure",
            HubError::ConnectionNotFound(_) => "connection_not_found",
        }
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The client closed the transport.
    ClientClosed,
    /// No inbound traffic within the idle window.
    IdleTimeout,
    /// The outbound queue overflowed.
    Backpressure,
    /// The hub is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Code sent to the client when the hub initiates the close.
    #[must_use]
    pub fn close_code(self) -> CloseCode {
        match self {
            CloseReason::Backpressure => CloseCode::Backpressure,
            CloseReason::ClientClosed | CloseReason::IdleTimeout | CloseReason::Shutdown => {
                CloseCode::Normal
            }
        }
    }

    /// Human-readable reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Backpressure => "outbound queue full",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
