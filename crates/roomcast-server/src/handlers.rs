//! HTTP routes for the roomcast server.
//!
//! Serves the WebSocket endpoint and a health check, and owns the hub for the
//! lifetime of the process.

use crate::config::Config;
use crate::metrics;
use crate::session::{self, Credentials};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use roomcast_core::memory::{MemoryBroker, MemoryStore};
use roomcast_core::{Hub, Ports};
use roomcast_protocol::{CloseCode, TenantId};
use roomcast_transport::{AxumWebSocket, Transport};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The hub serving every connection.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Start a hub over the in-process store and broker.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let ports = Ports::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBroker::new().client()),
            Arc::new(config.authenticator()),
        );

        Self {
            hub: Hub::start(config.hub_config(), ports),
            config,
        }
    }
}

/// Optional handshake credentials on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
    tenant: Option<String>,
}

impl ConnectParams {
    fn credentials(self) -> Option<Credentials> {
        match (self.token, self.tenant) {
            (Some(token), Some(tenant)) => Some(Credentials {
                token,
                tenant: TenantId::new(tenant),
            }),
            _ => None,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.auth.tokens.is_empty() {
        warn!("No tokens configured, every handshake will be refused");
    }

    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = app(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("roomcast listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let hub = state.hub.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutdown requested");
        hub.shutdown().await;
    })
    .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connections,
        "rooms": stats.rooms,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    remote: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let mut transport = AxumWebSocket::new(
                socket,
                remote.map(|ConnectInfo(addr)| addr),
                max_message_size,
            );

            if state.hub.stats().connections >= state.config.limits.max_connections {
                warn!("Connection limit reached");
                let _ = transport
                    .close(CloseCode::Unavailable, "too many connections")
                    .await;
                return;
            }

            session::run(
                state.hub.clone(),
                transport,
                params.credentials(),
                state.config.heartbeat.interval_ms,
            )
            .await;
        })
}
