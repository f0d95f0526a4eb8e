//! Per-connection façade.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use helm_core::{CallToken, ConnectionId};
use helm_rpc::errors::HANDLER_FAILED;
use helm_rpc::{AgentEvent, EventKind, ResponseEnvelope, RpcErrorObject};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{Broker, RpcCall};
use crate::errors::Result;

/// Parameter the agent reads as "the active tab".
const ACTIVE_TAB: i64 = -1;

/// Caller-facing handle for one agent connection.
///
/// Handles compare equal when they name the same connection id. A handle
/// stays valid across reconnects; calls fail with
/// [`BrokerError::NotConnected`](crate::BrokerError::NotConnected) while the
/// agent is away.
#[derive(Clone)]
pub struct AgentHandle {
    broker: Broker,
    id: ConnectionId,
}

impl AgentHandle {
    pub(crate) fn new(broker: Broker, id: ConnectionId) -> Self {
        Self { broker, id }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Whether the agent currently has a live transport.
    pub fn is_running(&self) -> bool {
        self.broker.is_connected(&self.id)
    }

    // ── Listeners ──

    /// Register a listener for every event of `kind`.
    pub fn on(&self, kind: EventKind, listener: impl Fn(&AgentEvent) + Send + Sync + 'static) {
        self.broker.subscribe(&self.id, kind, Arc::new(listener));
    }

    /// Run `f` when the agent's script ends.
    pub fn on_script_end(&self, f: impl Fn() + Send + Sync + 'static) {
        self.on(EventKind::ScriptEnded, move |_| f());
    }

    /// Run `f` when the agent reports a ban.
    pub fn on_ban(&self, f: impl Fn() + Send + Sync + 'static) {
        self.on(EventKind::Banned, move |_| f());
    }

    /// Run `f` when the transport closes.
    pub fn on_disconnect(&self, f: impl Fn() + Send + Sync + 'static) {
        self.on(EventKind::Disconnected, move |_| f());
    }

    /// Run `f` when the agent comes back within the grace window.
    pub fn on_reconnect(&self, f: impl Fn() + Send + Sync + 'static) {
        self.on(EventKind::Reconnected, move |_| f());
    }

    /// Receive free-form messages sent by the agent's script.
    pub fn on_script_message(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.on(EventKind::Custom, move |event| {
            if let AgentEvent::Custom { message } = event {
                f(message);
            }
        });
    }

    /// Answer requests sent by the agent's script.
    ///
    /// `Ok` values are serialized as the response result. An `Err`, or a
    /// panic inside `handler`, is sent back as an error response with code
    /// 500 and the failure text under `data.message`.
    pub fn on_script_request<F, R, E>(&self, handler: F)
    where
        F: Fn(&str) -> std::result::Result<R, E> + Send + Sync + 'static,
        R: Serialize + 'static,
        E: fmt::Display + 'static,
    {
        let broker = self.broker.clone();
        let id = self.id.clone();
        self.on(EventKind::CustomRequest, move |event| {
            let AgentEvent::CustomRequest { request, token } = event else {
                return;
            };
            let reply = match catch_unwind(AssertUnwindSafe(|| handler(request))) {
                Ok(Ok(value)) => match serde_json::to_value(value) {
                    Ok(result) => ResponseEnvelope::success(token.clone(), result),
                    Err(error) => handler_failure(token, &error),
                },
                Ok(Err(error)) => handler_failure(token, &error),
                Err(_) => handler_failure(token, &"script request handler panicked"),
            };
            if let Err(error) = broker.reply(&id, &reply) {
                warn!(connection_id = %id, %token, %error, "failed to answer script request");
            }
        });
    }

    // ── Calls ──

    /// Send a request and decode its result.
    pub async fn call<T: DeserializeOwned>(&self, call: RpcCall<T>) -> Result<Option<T>> {
        self.broker.call(&self.id, call).await
    }

    /// Send a request, using `T::default()` when the result does not fit `T`.
    pub async fn call_or_default<T>(&self, method: &str, params: Vec<Value>) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let call = RpcCall {
            default: Some(T::default()),
            ..RpcCall::new(method, params)
        };
        Ok(self.call(call).await?.unwrap_or_default())
    }

    /// Send a request whose result is not needed.
    pub async fn call_ack(&self, method: &str, params: Vec<Value>) -> Result<()> {
        self.broker.call_ack(&self.id, method, params).await
    }

    /// Queue an arbitrary JSON message without waiting for anything.
    pub fn send_raw(&self, message: &Value) -> Result<()> {
        self.broker.send_raw(&self.id, message)
    }

    /// Deliver a text message to the agent's running script.
    pub async fn send_script_message(&self, message: &str) -> Result<()> {
        self.call_ack("sendScriptMessage", vec![json!(ACTIVE_TAB), json!(message)])
            .await
    }

    /// Send a request to the agent's running script and decode the answer.
    pub async fn send_script_request<T: DeserializeOwned>(&self, request: &str) -> Result<Option<T>> {
        self.call(RpcCall::new("sendScriptRequest", vec![json!(request)]))
            .await
    }

    /// Ask the agent process to exit. Failures are ignored.
    pub async fn close(&self) {
        if let Err(error) = self.call_ack("killProcess", Vec::new()).await {
            debug!(connection_id = %self.id, %error, "kill request not acknowledged");
        }
    }
}

fn handler_failure(token: &CallToken, error: &dyn fmt::Display) -> ResponseEnvelope {
    ResponseEnvelope::failure(
        token.clone(),
        RpcErrorObject::new(HANDLER_FAILED, "Exception while processing event handler")
            .with_data(json!({ "message": error.to_string() })),
    )
}

impl PartialEq for AgentHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AgentHandle {}

impl Hash for AgentHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle").field("id", &self.id).finish_non_exhaustive()
    }
}
