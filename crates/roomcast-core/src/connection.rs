//! Connection manager.
//!
//! Owns the live connections of this instance: authenticates them, tracks
//! their liveness and hands out the receiving ends of their outbound queues.
//! Tearing a connection down is coordinated by [`crate::Hub::close`].

use crate::error::{AuthError, CloseReason, HubError};
use crate::identity::Identity;
use crate::ports::{Authenticator, EventStore};
use crate::registry::Outbox;
use dashmap::DashMap;
use roomcast_protocol::{ConnectionId, Event, TenantId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Close notification for one connection.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<Option<CloseReason>>,
}

impl CloseSignal {
    /// The close reason, if the hub has closed the connection.
    #[must_use]
    pub fn reason(&self) -> Option<CloseReason> {
        *self.rx.borrow()
    }

    /// Wait until the hub closes the connection.
    pub async fn wait(&mut self) -> CloseReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                return CloseReason::Shutdown;
            }
        }
    }
}

/// What a transport driver receives for an accepted connection.
#[derive(Debug)]
pub struct Session {
    /// Connection identifier.
    pub connection_id: ConnectionId,
    /// Resolved identity.
    pub identity: Identity,
    /// Events to write to the client, in delivery order.
    pub events: mpsc::Receiver<Arc<Event>>,
    /// Fires when the hub closes the connection.
    pub closed: CloseSignal,
}

pub(crate) struct ConnectionEntry {
    pub(crate) identity: Identity,
    pub(crate) outbox: Outbox,
    pub(crate) closer: watch::Sender<Option<CloseReason>>,
    last_seen: AtomicU64,
}

/// Live connections of this instance.
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    auth: Arc<dyn Authenticator>,
    store: Arc<dyn EventStore>,
    auth_timeout: Duration,
    idle_timeout: Duration,
    queue_capacity: usize,
    epoch: Instant,
}

impl ConnectionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(
        auth: Arc<dyn Authenticator>,
        store: Arc<dyn EventStore>,
        auth_timeout: Duration,
        idle_timeout: Duration,
        queue_capacity: usize,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            auth,
            store,
            auth_timeout,
            idle_timeout,
            queue_capacity,
            epoch: Instant::now(),
        }
    }

    /// Authenticate a client and register its connection.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Auth`] if the token is invalid, expired, issued for
    /// another tenant, or cannot be checked within the auth timeout. No
    /// connection exists afterwards.
    pub async fn accept(&self, token: &str, tenant_claim: &TenantId) -> Result<Session, HubError> {
        let identity = match timeout(self.auth_timeout, self.resolve(token, tenant_claim)).await {
            Ok(resolved) => resolved?,
            Err(_) => {
                warn!(tenant = %tenant_claim, "Auth lookup timed out");
                return Err(AuthError::Timeout.into());
            }
        };

        let connection_id = ConnectionId::generate();
        let (outbox, events) = Outbox::channel(self.queue_capacity);
        let (closer, closed) = watch::channel(None);

        self.connections.insert(
            connection_id.clone(),
            ConnectionEntry {
                identity: identity.clone(),
                outbox,
                closer,
                last_seen: AtomicU64::new(self.elapsed_ms()),
            },
        );

        info!(
            connection = %connection_id,
            identity = %identity.identity_id,
            tenant = %identity.tenant_id,
            "Connection accepted"
        );

        Ok(Session {
            connection_id,
            identity,
            events,
            closed: CloseSignal { rx: closed },
        })
    }

    /// Record inbound traffic.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn heartbeat(&self, connection: &ConnectionId) -> Result<(), HubError> {
        let entry = self
            .connections
            .get(connection)
            .ok_or_else(|| HubError::ConnectionNotFound(connection.clone()))?;
        entry.last_seen.store(self.elapsed_ms(), Ordering::Relaxed);
        Ok(())
    }

    /// Connections without inbound traffic for the idle window.
    #[must_use]
    pub fn idle_connections(&self) -> Vec<ConnectionId> {
        let now = self.elapsed_ms();
        let idle = self.idle_timeout.as_millis() as u64;
        self.connections
            .iter()
            .filter(|entry| now.saturating_sub(entry.last_seen.load(Ordering::Relaxed)) >= idle)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Identity behind a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn identity_of(&self, connection: &ConnectionId) -> Result<Identity, HubError> {
        self.connections
            .get(connection)
            .map(|entry| entry.identity.clone())
            .ok_or_else(|| HubError::ConnectionNotFound(connection.clone()))
    }

    /// Outbound queue of a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn outbox(&self, connection: &ConnectionId) -> Result<Outbox, HubError> {
        self.connections
            .get(connection)
            .map(|entry| entry.outbox.clone())
            .ok_or_else(|| HubError::ConnectionNotFound(connection.clone()))
    }

    /// Whether a connection is live.
    #[must_use]
    pub fn contains(&self, connection: &ConnectionId) -> bool {
        self.connections.contains_key(connection)
    }

    /// Number of live connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Ids of every live connection.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    // Unregister a connection. Only the first caller gets the entry.
    pub(crate) fn remove(&self, connection: &ConnectionId) -> Option<ConnectionEntry> {
        let (_, entry) = self.connections.remove(connection)?;
        entry.outbox.retire();
        debug!(connection = %connection, "Connection unregistered");
        Some(entry)
    }

    async fn resolve(&self, token: &str, tenant_claim: &TenantId) -> Result<Identity, HubError> {
        let identity = self.auth.verify(token, tenant_claim).await?;
        if &identity.tenant_id != tenant_claim {
            return Err(AuthError::TenantMismatch.into());
        }

        // The store's record is canonical when it has one.
        match self
            .store
            .read_identity(tenant_claim, &identity.identity_id)
            .await
        {
            Ok(Some(record)) if &record.tenant_id != tenant_claim => {
                Err(AuthError::TenantMismatch.into())
            }
            Ok(Some(record)) => Ok(record),
            Ok(None) => Ok(identity),
            Err(err) => {
                warn!(
                    identity = %identity.identity_id,
                    error = %err,
                    "Identity lookup failed, using token identity"
                );
                Ok(identity)
            }
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
