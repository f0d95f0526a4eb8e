//! Settings types.
//!
//! Every struct is `#[serde(default)]` so a partial settings file only needs
//! to name the values it changes. Durations are stored in milliseconds.

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelmSettings {
    /// Network listener settings.
    pub server: ServerSettings,
    /// Request correlation and connection lifecycle settings.
    pub broker: BrokerSettings,
    /// Connection URL derivation settings.
    pub addressing: AddressingSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

/// Network listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// WebSocket listen port.
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Interval between server-initiated Ping frames.
    pub ping_interval_ms: u64,
    /// Silence after which a connection is considered dead.
    pub pong_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 16 * 1024 * 1024,
            outbound_queue: 1024,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 60_000,
        }
    }
}

/// Request correlation and connection lifecycle settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Default bound on waiting for a response.
    pub call_timeout_ms: u64,
    /// How long a disconnected agent's bookkeeping is retained.
    pub grace_period_ms: u64,
    /// How long a launcher waits for a freshly started agent to connect.
    pub connect_timeout_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            grace_period_ms: 30 * 60 * 1000,
            connect_timeout_ms: 60_000,
        }
    }
}

/// Connection URL derivation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddressingSettings {
    /// Endpoint whose body is this host's public IP address.
    pub public_ip_url: String,
    /// Connect and read timeout for the public IP lookup.
    pub lookup_timeout_ms: u64,
}

impl Default for AddressingSettings {
    fn default() -> Self {
        Self {
            public_ip_url: "http://checkip.amazonaws.com".to_string(),
            lookup_timeout_ms: 15_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
