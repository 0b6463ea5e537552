//! Per-connection session driver.
//!
//! Drives one client transport against the hub: the handshake, then a loop
//! that writes queued events and answers inbound requests until either side
//! closes.

use crate::metrics;
use roomcast_core::{CloseReason, Hub, HubError, Session};
use roomcast_protocol::{
    ClientFrame, CloseCode, ConnectionId, EventId, EventKind, RoomId, ServerFrame, TenantId,
    Version, PROTOCOL_VERSION,
};
use roomcast_transport::{Inbound, Transport};
use serde_json::Value;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Credentials supplied outside the frame stream, e.g. as query parameters.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Bearer token.
    pub token: String,
    /// Claimed tenant.
    pub tenant: TenantId,
}

/// Run a client session to completion.
pub async fn run<T: Transport>(
    hub: Hub,
    mut transport: T,
    credentials: Option<Credentials>,
    heartbeat_ms: u64,
) {
    let started = Instant::now();
    let session = match handshake(&hub, &mut transport, credentials).await {
        Ok(session) => session,
        Err((code, message)) => {
            debug!(transport = transport.name(), code = %code, message = %message, "Handshake refused");
            let _ = transport.close(code, &message).await;
            return;
        }
    };
    metrics::record_handshake(started.elapsed().as_secs_f64());

    let connected = ServerFrame::Connected {
        connection_id: session.connection_id.clone(),
        identity_id: session.identity.identity_id.clone(),
        heartbeat_ms,
        version: PROTOCOL_VERSION.to_string(),
    };
    let reason = if send(&mut transport, &connected).await {
        drive(&hub, &mut transport, session).await
    } else {
        hub.close(&session.connection_id, CloseReason::ClientClosed)
            .await;
        CloseReason::ClientClosed
    };

    metrics::record_close(reason);
    metrics::set_hub_stats(&hub.stats());
    let _ = transport
        .close(reason.close_code(), reason.as_str())
        .await;
}

async fn handshake<T: Transport>(
    hub: &Hub,
    transport: &mut T,
    credentials: Option<Credentials>,
) -> Result<Session, (CloseCode, String)> {
    let credentials = match credentials {
        Some(credentials) => credentials,
        None => {
            let first = timeout(hub.config().auth_timeout, transport.recv()).await;
            match first {
                Ok(Ok(Some(Inbound::Frame(ClientFrame::Connect {
                    token,
                    tenant,
                    version,
                })))) => {
                    check_version(version.as_deref())?;
                    Credentials { token, tenant }
                }
                Ok(Ok(Some(Inbound::Frame(other)))) => {
                    return Err((
                        CloseCode::MalformedFrame,
                        format!("expected connect, got {}", other.frame_type()),
                    ));
                }
                Ok(Ok(Some(Inbound::Malformed(reason)))) => {
                    return Err((CloseCode::MalformedFrame, reason));
                }
                Ok(Ok(Some(Inbound::Ping))) => {
                    return Err((CloseCode::MalformedFrame, "expected connect".into()));
                }
                Ok(Ok(None) | Err(_)) => {
                    return Err((CloseCode::Normal, "closed before connect".into()));
                }
                Err(_) => {
                    metrics::record_handshake_failure("timeout");
                    return Err((CloseCode::Unauthorized, "no connect frame in time".into()));
                }
            }
        }
    };

    hub.accept(&credentials.token, &credentials.tenant)
        .await
        .map_err(|err| {
            metrics::record_handshake_failure(err.kind());
            (err.close_code(), err.to_string())
        })
}

fn check_version(version: Option<&str>) -> Result<(), (CloseCode, String)> {
    let Some(version) = version else {
        return Ok(());
    };
    match version.parse::<Version>() {
        Ok(version) if version.is_compatible_with(&PROTOCOL_VERSION) => Ok(()),
        _ => Err((
            CloseCode::MalformedFrame,
            format!("unsupported protocol version {version}, server speaks {PROTOCOL_VERSION}"),
        )),
    }
}

async fn drive<T: Transport>(hub: &Hub, transport: &mut T, mut session: Session) -> CloseReason {
    let connection = session.connection_id.clone();
    info!(
        connection = %connection,
        transport = transport.name(),
        remote = ?transport.remote_addr(),
        "Session started"
    );

    let reason = loop {
        tokio::select! {
            biased;

            reason = session.closed.wait() => break reason,

            event = session.events.recv() => {
                let Some(event) = event else {
                    break session.closed.wait().await;
                };
                let frame = ServerFrame::Event { event: (*event).clone() };
                if !send(transport, &frame).await {
                    break CloseReason::ClientClosed;
                }
            }

            inbound = transport.recv() => {
                let frame = match inbound {
                    Ok(Some(inbound)) => inbound,
                    Ok(None) => break CloseReason::ClientClosed,
                    Err(e) => {
                        debug!(connection = %connection, error = %e, "Transport error");
                        break CloseReason::ClientClosed;
                    }
                };
                metrics::record_frame("inbound");

                if let Err(err) = hub.heartbeat(&connection).await {
                    debug!(connection = %connection, error = %err, "Heartbeat on closed connection");
                    break session.closed.wait().await;
                }

                let reply = match frame {
                    Inbound::Frame(frame) => Some(handle_frame(hub, &connection, frame).await),
                    Inbound::Ping => None,
                    Inbound::Malformed(reason) => {
                        warn!(connection = %connection, reason = %reason, "Malformed frame");
                        Some(ServerFrame::error(None, CloseCode::MalformedFrame, reason))
                    }
                };
                if let Some(reply) = reply {
                    if !send(transport, &reply).await {
                        break CloseReason::ClientClosed;
                    }
                }
            }
        }
    };

    // Harmless if the hub closed it first.
    hub.close(&connection, reason).await;
    info!(connection = %connection, reason = %reason, "Session ended");
    reason
}

async fn handle_frame(hub: &Hub, connection: &ConnectionId, frame: ClientFrame) -> ServerFrame {
    let result = match frame {
        ClientFrame::Connect { .. } => Err((None, HubError::invalid("already connected"))),

        ClientFrame::Subscribe { room_id, id } => {
            debug!(connection = %connection, room = %room_id, "Subscribe request");
            let result = hub.subscribe(connection, &room_id).await;
            metrics::set_hub_stats(&hub.stats());
            result
                .map(|_| ack(id, room_id, None))
                .map_err(|err| (id, err))
        }

        ClientFrame::Unsubscribe { room_id, id } => {
            debug!(connection = %connection, room = %room_id, "Unsubscribe request");
            hub.unsubscribe(connection, &room_id)
                .await
                .map(|_| ack(id, room_id, None))
                .map_err(|err| (id, err))
        }

        ClientFrame::Message { room_id, payload, id } => {
            publish(hub, connection, room_id, EventKind::Message, payload, id).await
        }
        ClientFrame::TypingStart { room_id, payload, id } => {
            publish(hub, connection, room_id, EventKind::TypingStart, payload, id).await
        }
        ClientFrame::TypingStop { room_id, payload, id } => {
            publish(hub, connection, room_id, EventKind::TypingStop, payload, id).await
        }
        ClientFrame::RoomState { room_id, payload, id } => {
            publish(hub, connection, room_id, EventKind::RoomStateChanged, payload, id).await
        }

        ClientFrame::Status { status, id } => hub
            .set_status(connection, status)
            .await
            .map(|()| ServerFrame::ack(id))
            .map_err(|err| (id, err)),

        ClientFrame::History { room_id, limit, id } => hub
            .recent_history(connection, &room_id, limit)
            .await
            .map(|events| ServerFrame::History { id, room_id, events })
            .map_err(|err| (id, err)),

        ClientFrame::Ping { timestamp } => Ok(ServerFrame::Pong { timestamp }),
    };

    match result {
        Ok(frame) => frame,
        Err((id, err)) => {
            metrics::record_failure(&err);
            debug!(connection = %connection, error = %err, "Request failed");
            ServerFrame::error(id, err.close_code(), err.to_string())
        }
    }
}

async fn publish(
    hub: &Hub,
    connection: &ConnectionId,
    room_id: RoomId,
    kind: EventKind,
    payload: Value,
    id: Option<u64>,
) -> Result<ServerFrame, (Option<u64>, HubError)> {
    let event = hub
        .publish(connection, &room_id, kind, payload)
        .await
        .map_err(|err| (id, err))?;
    metrics::record_published(kind.as_str());
    Ok(ack(id, room_id, Some(event.event_id)))
}

fn ack(id: Option<u64>, room_id: RoomId, event_id: Option<EventId>) -> ServerFrame {
    ServerFrame::Ack {
        id,
        room_id: Some(room_id),
        event_id,
    }
}

async fn send<T: Transport>(transport: &mut T, frame: &ServerFrame) -> bool {
    match transport.send(frame).await {
        Ok(()) => {
            metrics::record_frame("outbound");
            true
        }
        Err(e) => {
            debug!(frame_type = frame.frame_type(), error = %e, "Send failed");
            false
        }
    }
}
