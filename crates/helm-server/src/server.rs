//! `HelmServer`: axum HTTP + WebSocket front end for the broker.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::broker::{Broker, Handshake};
use crate::config::ServerConfig;
use crate::errors::{BrokerError, Result};
use crate::health::{self, HealthResponse};
use crate::websocket::session::run_ws_session;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The broker every session registers with.
    pub broker: Broker,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server was created.
    pub start_time: Instant,
}

/// The helm server.
pub struct HelmServer {
    config: Arc<ServerConfig>,
    broker: Broker,
    start_time: Instant,
    bound: OnceLock<SocketAddr>,
}

impl HelmServer {
    /// Create a server in front of `broker`.
    pub fn new(config: ServerConfig, broker: Broker) -> Self {
        Self {
            config: Arc::new(config),
            broker,
            start_time: Instant::now(),
            bound: OnceLock::new(),
        }
    }

    /// Build the axum router.
    ///
    /// `/health` reports counters; `/` and `/{connection_id}` upgrade to an
    /// agent session, the former with a generated id.
    pub fn router(&self) -> Router {
        let state = AppState {
            broker: self.broker.clone(),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/", get(ws_root_handler))
            .route("/{connection_id}", get(ws_handler))
            .with_state(state)
    }

    /// Bind the configured address and serve until the broker shuts down.
    ///
    /// Returns the bound address and the serve task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|source| BrokerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let local = listener
            .local_addr()
            .map_err(|source| BrokerError::Bind { addr, source })?;
        let _ = self.bound.set(local);

        let router = self.router();
        let token = self.broker.shutdown_token();
        info!(%local, "helm server listening");

        let handle = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(%error, "server loop failed");
            }
            info!("helm server stopped");
        });
        Ok((local, handle))
    }

    /// Bound port once listening, the configured port before.
    pub fn port(&self) -> u16 {
        self.bound.get().map_or(self.config.port, SocketAddr::port)
    }

    /// Loopback address an agent uses to connect as `id`.
    pub fn local_connection_url(&self, id: impl fmt::Display) -> String {
        format!("ws://127.0.0.1:{}/{id}", self.port())
    }

    /// Publicly routable address an agent uses to connect as `id`.
    pub async fn remote_connection_url(&self, id: impl fmt::Display) -> Result<String> {
        let ip = self.public_ip().await?;
        Ok(format!("ws://{ip}:{}/{id}", self.port()))
    }

    /// This host's public IP, as reported by the configured lookup endpoint.
    pub async fn public_ip(&self) -> Result<String> {
        let result = lookup_public_ip(&self.config).await;
        if let Err(error) = &result {
            warn!(url = %self.config.public_ip_url, %error, "public IP lookup failed");
        }
        result
    }

    /// The broker.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

async fn lookup_public_ip(config: &ServerConfig) -> Result<String> {
    let failed = |error: reqwest::Error| BrokerError::AddressLookup(error.to_string());
    let client = reqwest::Client::builder()
        .timeout(config.lookup_timeout)
        .build()
        .map_err(failed)?;
    let body = client
        .get(&config.public_ip_url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(failed)?
        .text()
        .await
        .map_err(failed)?;

    body.lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| BrokerError::AddressLookup("empty response body".into()))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.broker.live_count(),
        state.broker.dormant_count(),
    ))
}

/// GET / (agent without an id)
async fn ws_root_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, state, Handshake::new("/"))
}

/// GET /{connection_id}
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(connection_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, Handshake::new(format!("/{connection_id}")))
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, handshake: Handshake) -> Response {
    if state.broker.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, handshake, state.broker, state.config))
}
