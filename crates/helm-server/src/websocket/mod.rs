//! WebSocket transport: the live connection handle and the per-socket session loop.

pub mod connection;
pub mod session;
