//! Runtime configuration.

use std::time::Duration;

use helm_settings::HelmSettings;

/// Timing knobs consumed by the broker.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Bound on waiting for a response when a call does not set its own.
    pub call_timeout: Duration,
    /// How long a dormant connection's bookkeeping survives.
    pub grace_period: Duration,
    /// Bound applied by [`crate::PendingConnection::wait_default`].
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(30 * 60),
            connect_timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration for the helm server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Interval between server-initiated Ping frames.
    pub ping_interval: Duration,
    /// Silence after which a connection is closed.
    pub pong_timeout: Duration,
    /// Endpoint returning this host's public IP.
    pub public_ip_url: String,
    /// Timeout for the public IP lookup.
    pub lookup_timeout: Duration,
    /// Broker timings.
    pub broker: BrokerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            outbound_queue: 1024,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            public_ip_url: "http://checkip.amazonaws.com".into(),
            lookup_timeout: Duration::from_secs(15),
            broker: BrokerConfig::default(),
        }
    }
}

impl From<&HelmSettings> for ServerConfig {
    fn from(settings: &HelmSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
            outbound_queue: settings.server.outbound_queue,
            ping_interval: Duration::from_millis(settings.server.ping_interval_ms),
            pong_timeout: Duration::from_millis(settings.server.pong_timeout_ms),
            public_ip_url: settings.addressing.public_ip_url.clone(),
            lookup_timeout: Duration::from_millis(settings.addressing.lookup_timeout_ms),
            broker: BrokerConfig {
                call_timeout: Duration::from_millis(settings.broker.call_timeout_ms),
                grace_period: Duration::from_millis(settings.broker.grace_period_ms),
                connect_timeout: Duration::from_millis(settings.broker.connect_timeout_ms),
            },
        }
    }
}
