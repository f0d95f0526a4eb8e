//! Outstanding call correlation.
//!
//! Each call registers a single-use completion slot under a fresh token
//! before its request is transmitted. The slot is removed when the matching
//! response arrives or when the caller stops waiting, so a response that
//! shows up late finds nothing and is dropped.

use std::time::Duration;

use dashmap::DashMap;
use helm_core::{CallToken, ConnectionId};
use helm_rpc::ResponseEnvelope;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// Bound on waiting for a response when neither the call nor the broker
/// configuration says otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// One request to an agent.
///
/// `default` is returned when the agent's result does not fit `T`.
/// `timeout` of `None` uses the broker's configured call timeout.
#[derive(Clone, Debug)]
pub struct RpcCall<T> {
    /// Method name.
    pub method: String,
    /// Positional parameters.
    pub params: Vec<Value>,
    /// Value used when the result cannot be decoded as `T`.
    pub default: Option<T>,
    /// Per-call bound on waiting for the response.
    pub timeout: Option<Duration>,
}

impl<T> RpcCall<T> {
    /// A call with no default and the broker's timeout.
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            default: None,
            timeout: None,
        }
    }
}

struct PendingCall {
    connection_id: ConnectionId,
    method: String,
    tx: oneshot::Sender<ResponseEnvelope>,
}

/// Token → waiting caller.
#[derive(Default)]
pub struct CallTable {
    pending: DashMap<CallToken, PendingCall>,
}

impl CallTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call to `connection_id` under a fresh token.
    ///
    /// The entry lives until the response is delivered or the returned
    /// guard is dropped.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        method: &str,
    ) -> (PendingGuard<'_>, oneshot::Receiver<ResponseEnvelope>) {
        let (tx, rx) = oneshot::channel();
        let token = CallToken::new();
        let _ = self.pending.insert(
            token.clone(),
            PendingCall {
                connection_id,
                method: method.to_owned(),
                tx,
            },
        );
        (PendingGuard { table: self, token }, rx)
    }

    /// Deliver a response received on `from`.
    ///
    /// Returns `false` if no call is waiting on the token, or the waiting
    /// call targets a different connection.
    pub fn complete(&self, from: &ConnectionId, response: ResponseEnvelope) -> bool {
        let Some((token, pending)) = self
            .pending
            .remove_if(&response.id, |_, p| &p.connection_id == from)
        else {
            debug!(connection_id = %from, token = %response.id, "dropping response with no pending call");
            return false;
        };

        debug!(connection_id = %from, %token, method = %pending.method, "response received");
        if pending.tx.send(response).is_err() {
            debug!(connection_id = %from, %token, "caller stopped waiting before delivery");
            return false;
        }
        true
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Outstanding calls targeting `connection_id`.
    pub fn pending_for(&self, connection_id: &ConnectionId) -> usize {
        self.pending
            .iter()
            .filter(|entry| &entry.value().connection_id == connection_id)
            .count()
    }
}

/// Removes its call's entry when dropped.
pub struct PendingGuard<'a> {
    table: &'a CallTable,
    token: CallToken,
}

impl PendingGuard<'_> {
    /// Token the request must carry.
    pub fn token(&self) -> &CallToken {
        &self.token
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.table.pending.remove(&self.token);
    }
}
