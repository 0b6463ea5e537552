//! Hub configuration.

use roomcast_protocol::InstanceId;
use std::time::Duration;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Identifies this process on the broker.
    pub instance_id: InstanceId,
    /// Connections without inbound traffic for this long are closed.
    pub idle_timeout: Duration,
    /// How often the idle sweeper runs.
    pub idle_sweep_interval: Duration,
    /// Upper bound on the auth lookup during `accept`.
    pub auth_timeout: Duration,
    /// Upper bound on reserving and writing an event.
    pub persistence_timeout: Duration,
    /// Upper bound on a single broker operation.
    pub broker_timeout: Duration,
    /// Delay between broker resubscribe attempts.
    pub broker_retry_backoff: Duration,
    /// How long an identity stays online after its last connection closes.
    pub presence_grace: Duration,
    /// Lifetime of a stored presence entry without refresh.
    pub presence_ttl: Duration,
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// Maximum number of events returned by a history replay.
    pub history_limit: usize,
    /// Store TTL for typing and presence events.
    pub ephemeral_ttl: Duration,
    /// Minimum time an event past a sequence gap waits for the gap to fill.
    /// See [`HubConfig::gap_timeout`].
    pub reorder_window: Duration,
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
    /// Maximum serialized payload size in bytes.
    pub max_payload_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            instance_id: InstanceId::generate(),
            idle_timeout: Duration::from_secs(60),
            idle_sweep_interval: Duration::from_secs(15),
            auth_timeout: Duration::from_secs(5),
            persistence_timeout: Duration::from_secs(3),
            broker_timeout: Duration::from_secs(3),
            broker_retry_backoff: Duration::from_secs(1),
            presence_grace: Duration::from_secs(10),
            presence_ttl: Duration::from_secs(90),
            queue_capacity: 256,
            history_limit: 50,
            ephemeral_ttl: Duration::from_secs(30),
            reorder_window: Duration::from_millis(250),
            max_rooms_per_connection: 100,
            max_payload_bytes: 64 * 1024,
        }
    }
}

impl HubConfig {
    /// How long a sequence gap is waited on before it is given up.
    ///
    /// A peer's event can legitimately trail a later one by a full write plus
    /// a full broker publish, so the reorder window is raised to cover both.
    #[must_use]
    pub fn gap_timeout(&self) -> Duration {
        self.reorder_window
            .max(self.persistence_timeout + self.broker_timeout)
    }
}
