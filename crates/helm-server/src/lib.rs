//! # helm-server
//!
//! The connection broker and its WebSocket front end.
//!
//! - [`broker::Broker`]: identity, live/dormant lifecycle with a grace window,
//!   request/response correlation under a timeout, per-connection event routing
//! - [`broker::AgentHandle`]: the per-connection façade callers use
//! - [`server::HelmServer`]: axum router, WebSocket upgrade, connection URLs
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod broker;
pub mod config;
pub mod errors;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use broker::{AgentHandle, Broker, BrokerBuilder, ConnectionInfo, PendingConnection, RpcCall};
pub use errors::{BrokerError, Result};
