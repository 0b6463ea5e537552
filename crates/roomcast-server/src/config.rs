//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - The first TOML file found in [`CONFIG_PATHS`]
//! - Environment variables (`ROOMCAST__SECTION__KEY`)

use anyhow::{Context, Result};
use roomcast_core::memory::StaticAuthenticator;
use roomcast_core::{HubConfig, Identity};
use roomcast_protocol::{IdentityKind, InstanceId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Files searched by [`Config::load`], in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "roomcast.toml",
    "/etc/roomcast/roomcast.toml",
    "~/.config/roomcast/roomcast.toml",
];

const ENV_PREFIX: &str = "ROOMCAST";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Hub timers and windows.
    #[serde(default)]
    pub hub: HubSection,

    /// Static credentials.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum rooms a connection may join.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum serialized event payload in bytes.
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle window in milliseconds after which a silent connection is closed.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Hub timers and windows, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubSection {
    /// Broker identity of this process. Generated when unset.
    pub instance_id: Option<String>,
    /// Idle sweep period.
    pub idle_sweep_interval_ms: Option<u64>,
    /// Upper bound on the handshake auth lookup.
    pub auth_timeout_ms: Option<u64>,
    /// Upper bound on persisting an event.
    pub persistence_timeout_ms: Option<u64>,
    /// Upper bound on a broker operation.
    pub broker_timeout_ms: Option<u64>,
    /// Delay between broker resubscribe attempts.
    pub broker_retry_backoff_ms: Option<u64>,
    /// Grace window before an identity goes offline.
    pub presence_grace_ms: Option<u64>,
    /// Stored presence lifetime.
    pub presence_ttl_ms: Option<u64>,
    /// Store TTL of typing and presence events.
    pub ephemeral_ttl_ms: Option<u64>,
    /// Wait for a sequence gap to fill.
    pub reorder_window_ms: Option<u64>,
    /// Maximum events in a history replay.
    pub history_limit: Option<usize>,
}

/// Static token table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accepted tokens.
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// One accepted token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Bearer token.
    pub token: String,
    /// Tenant the identity belongs to.
    pub tenant: String,
    /// Identity the token authenticates.
    pub identity: String,
    /// Identity kind.
    #[serde(default = "default_kind")]
    pub kind: IdentityKind,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_rooms() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_payload() -> usize {
    64 * 1024
}

fn default_queue_capacity() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_kind() -> IdentityKind {
    IdentityKind::Visitor
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            hub: HubSection::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_rooms_per_connection: default_max_rooms(),
            max_message_size: default_max_message_size(),
            max_payload_bytes: default_max_payload(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS.iter().find_map(|path| {
            let expanded = shellexpand::tilde(path);
            Path::new(expanded.as_ref())
                .exists()
                .then(|| expanded.into_owned())
        });

        if let Some(path) = &file {
            info!(path = %path, "Using config file");
        }

        Self::layered(file.as_deref(), ::config::Environment::with_prefix(ENV_PREFIX))
    }

    fn layered(file: Option<&str>, env: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Toml));
        }

        builder
            .add_source(
                env.prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file, without overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Hub configuration with every unset knob at its default.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        let defaults = HubConfig::default();
        let ms = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_millis);
        let hub = &self.hub;

        HubConfig {
            instance_id: hub
                .instance_id
                .clone()
                .map_or(defaults.instance_id, InstanceId::new),
            idle_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
            idle_sweep_interval: ms(hub.idle_sweep_interval_ms, defaults.idle_sweep_interval),
            auth_timeout: ms(hub.auth_timeout_ms, defaults.auth_timeout),
            persistence_timeout: ms(hub.persistence_timeout_ms, defaults.persistence_timeout),
            broker_timeout: ms(hub.broker_timeout_ms, defaults.broker_timeout),
            broker_retry_backoff: ms(hub.broker_retry_backoff_ms, defaults.broker_retry_backoff),
            presence_grace: ms(hub.presence_grace_ms, defaults.presence_grace),
            presence_ttl: ms(hub.presence_ttl_ms, defaults.presence_ttl),
            queue_capacity: self.limits.queue_capacity,
            history_limit: hub.history_limit.unwrap_or(defaults.history_limit),
            ephemeral_ttl: ms(hub.ephemeral_ttl_ms, defaults.ephemeral_ttl),
            reorder_window: ms(hub.reorder_window_ms, defaults.reorder_window),
            max_rooms_per_connection: self.limits.max_rooms_per_connection,
            max_payload_bytes: self.limits.max_payload_bytes,
        }
    }

    /// Authenticator over the static token table.
    #[must_use]
    pub fn authenticator(&self) -> StaticAuthenticator {
        let auth = StaticAuthenticator::new();
        for entry in &self.auth.tokens {
            auth.insert(
                entry.token.clone(),
                Identity::new(entry.identity.clone(), entry.kind, entry.tenant.clone()),
            );
        }
        auth
    }
}
