//! `/health` endpoint.

use serde::Serialize;
use tokio::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live agent connections.
    pub connections: usize,
    /// Disconnected agents still inside their grace window.
    pub dormant: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, dormant: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        dormant,
    }
}
