//! # helm-core
//!
//! Foundation types shared by every helm crate:
//!
//! - **Branded IDs**: [`ConnectionId`] and [`CallToken`] as newtypes so a
//!   correlation token can never be passed where a connection id is expected
//! - **Logging**: `tracing` subscriber setup and in-memory log capture for tests

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;

pub use ids::{CallToken, ConnectionId};
