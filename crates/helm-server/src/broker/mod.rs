//! The connection broker.
//!
//! Per connection id the broker moves through
//! `UNKNOWN → LIVE → DORMANT → (REMOVED | LIVE)`:
//!
//! - **accept**: the transport becomes live. Waiters are woken. A dormant id
//!   has its cleanup cancelled and its listeners receive `Reconnected`; any
//!   other id is announced to the on-connect callback.
//! - **disconnected**: the transport is dropped, listeners receive
//!   `Disconnected`, and a cleanup is scheduled after the grace period.
//! - **cleanup**: if the id is still not live, its listeners are discarded.
//!   Waiters stay registered until their own timeout.
//!
//! Accept and disconnect for the same id are serialized, so a reconnect
//! racing a close always sees the scheduled cleanup and is reported as
//! `Reconnected` after `Disconnected`.
//!
//! Calls in flight when a transport closes are not failed early; they end
//! at their own timeout.

mod calls;
mod events;
mod handle;
mod identity;
mod registry;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use helm_core::ConnectionId;
use helm_rpc::errors::METHOD_NOT_FOUND;
use helm_rpc::events::{CUSTOM_REQUEST_METHOD, EVENT_DISPATCH_METHOD};
use helm_rpc::{
    AgentEvent, EventKind, Inbound, RequestEnvelope, ResponseEnvelope, RpcErrorObject, decode_result,
    encode,
};
use metrics::{counter, gauge};
use serde::Serialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::errors::{BrokerError, Result};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::LiveConnection;

pub use calls::{CallTable, DEFAULT_CALL_TIMEOUT, PendingGuard, RpcCall};
pub use events::{EventBus, Listener};
pub use handle::AgentHandle;
pub use identity::Handshake;

use registry::Registry;

/// Callback invoked once for each newly connected (not reconnected) agent.
pub type OnConnect = Arc<dyn Fn(AgentHandle) + Send + Sync>;

/// Snapshot of one live connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnectionId,
    /// When the current transport was accepted.
    pub connected_at: DateTime<Utc>,
}

/// Configures and builds a [`Broker`].
#[derive(Default)]
pub struct BrokerBuilder {
    config: BrokerConfig,
    on_connect: Option<OnConnect>,
}

impl BrokerBuilder {
    /// Replace the timing configuration.
    #[must_use]
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the callback run for each new agent connection.
    #[must_use]
    pub fn on_connect(mut self, callback: impl Fn(AgentHandle) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    /// Build the broker.
    pub fn build(self) -> Broker {
        Broker {
            inner: Arc::new(BrokerInner {
                config: self.config,
                registry: Registry::default(),
                calls: CallTable::new(),
                events: EventBus::new(),
                on_connect: self.on_connect,
                shutdown: ShutdownCoordinator::new(),
            }),
        }
    }
}

struct BrokerInner {
    config: BrokerConfig,
    registry: Registry,
    calls: CallTable,
    events: EventBus,
    on_connect: Option<OnConnect>,
    shutdown: ShutdownCoordinator,
}

impl BrokerInner {
    fn fire_cleanup(&self, id: &ConnectionId, generation: u64) {
        let discarded = self.registry.fire_cleanup(id, generation, || {
            let _ = self.events.remove(id);
        });
        if discarded {
            counter!("helm_cleanups_total").increment(1);
            info!(connection_id = %id, "grace period elapsed, connection bookkeeping discarded");
        } else {
            debug!(connection_id = %id, generation, "stale cleanup skipped");
        }
    }
}

/// Shared broker state. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Start configuring a broker.
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    /// Broker with the given timings and no on-connect callback.
    pub fn new(config: BrokerConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Timing configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Façade for `id`, whether or not it is currently live.
    pub fn handle(&self, id: impl Into<ConnectionId>) -> AgentHandle {
        AgentHandle::new(self.clone(), id.into())
    }

    // ── Lifecycle ──

    /// Register a newly opened transport.
    ///
    /// Fails with [`BrokerError::DuplicateConnection`] if the id is already
    /// live (the existing connection is untouched) and with
    /// [`BrokerError::ShuttingDown`] after [`shutdown`](Self::shutdown).
    pub fn accept(&self, conn: Arc<LiveConnection>) -> Result<AgentHandle> {
        let id = conn.id.clone();
        if self.is_shutting_down() {
            return Err(BrokerError::ShuttingDown);
        }
        self.transition(&id, || {
            if !self.inner.registry.insert_live(conn) {
                counter!("helm_duplicate_connections_total").increment(1);
                warn!(connection_id = %id, "duplicate connection rejected, id is already live");
                return Err(BrokerError::DuplicateConnection(id.clone()));
            }
            counter!("helm_connections_total").increment(1);
            gauge!("helm_connections_active").increment(1.0);

            let handle = self.handle(id.clone());
            let woken = self.inner.registry.signal_waiters(&id);
            if woken > 0 {
                debug!(connection_id = %id, woken, "connection waiters signalled");
            }

            if self.inner.registry.cancel_cleanup(&id) {
                info!(connection_id = %id, "agent reconnected");
                let _ = self.inner.events.publish(&id, &AgentEvent::Reconnected);
            } else {
                info!(connection_id = %id, "agent connected");
                if let Some(on_connect) = &self.inner.on_connect {
                    let fresh = handle.clone();
                    if catch_unwind(AssertUnwindSafe(|| on_connect(fresh))).is_err() {
                        error!(connection_id = %id, "on-connect callback panicked");
                    }
                }
            }
            Ok(handle)
        })
    }

    /// Record that `conn` closed.
    ///
    /// A transport that is no longer the live one for its id (for example a
    /// rejected duplicate) is ignored.
    pub fn disconnected(&self, conn: &Arc<LiveConnection>) {
        let id = &conn.id;
        self.transition(id, || {
            if !self.inner.registry.remove_live(conn) {
                return;
            }
            gauge!("helm_connections_active").decrement(1.0);

            if self.is_shutting_down() {
                info!(connection_id = %id, "agent disconnected during shutdown");
            } else {
                self.schedule_cleanup(id.clone());
                info!(
                    connection_id = %id,
                    grace_secs = self.inner.config.grace_period.as_secs(),
                    in_flight = self.inner.calls.pending_for(id),
                    "agent disconnected, keeping bookkeeping for grace period"
                );
            }
            let _ = self.inner.events.publish(id, &AgentEvent::Disconnected);
        });
    }

    /// Run one lifecycle step for `id` while holding its gate.
    ///
    /// Listeners and the on-connect callback run inside the step and must not
    /// call back into `accept` or `disconnected` for the same id.
    fn transition<R>(&self, id: &ConnectionId, step: impl FnOnce() -> R) -> R {
        let gate = self.inner.registry.gate(id);
        let result = {
            let _held = gate.lock();
            step()
        };
        drop(gate);
        self.inner.registry.release_gate(id);
        result
    }

    fn schedule_cleanup(&self, id: ConnectionId) {
        let generation = self.inner.registry.next_generation();
        let delay = self.inner.config.grace_period;
        let weak: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_cleanup(&task_id, generation);
            }
        });
        self.inner.registry.install_cleanup(id, generation, task.abort_handle());
    }

    /// Register a waiter for `id` before launching the agent that will
    /// connect with it.
    pub fn expect_connection(&self, id: impl Into<ConnectionId>) -> PendingConnection {
        let id = id.into();
        let (ticket, rx) = self.inner.registry.add_waiter(id.clone());
        PendingConnection {
            broker: self.clone(),
            id,
            ticket,
            rx: Some(rx),
        }
    }

    /// Stop accepting connections, close live transports, and cancel every
    /// scheduled cleanup. Outstanding calls are left to time out.
    pub fn shutdown(&self) {
        if self.is_shutting_down() {
            return;
        }
        info!(
            live = self.inner.registry.live_count(),
            dormant = self.inner.registry.dormant_count(),
            "broker shutting down"
        );
        self.inner.shutdown.shutdown();
        for conn in self.inner.registry.live_connections() {
            conn.close();
        }
        self.inner.registry.abort_cleanups();
        self.inner.registry.clear_waiters();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_shutting_down()
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.token()
    }

    /// Close signal for a new session; cancelled on shutdown.
    pub fn session_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    // ── Inbound ──

    /// Route one inbound text frame from `id`.
    ///
    /// Responses complete their pending call, event dispatches reach the
    /// listeners, and calls to any other method are answered with a
    /// method-not-found error. Malformed frames are logged and dropped.
    pub fn handle_inbound(&self, id: &ConnectionId, text: &str) {
        match Inbound::parse(text) {
            Ok(Inbound::Response(response)) => {
                let _ = self.inner.calls.complete(id, response);
            }
            Ok(Inbound::Request(request)) => self.handle_request(id, &request),
            Err(error) => {
                counter!("helm_inbound_rejected_total").increment(1);
                warn!(connection_id = %id, %error, "dropping malformed inbound message");
            }
        }
    }

    fn handle_request(&self, id: &ConnectionId, request: &RequestEnvelope) {
        let parsed = match request.method.as_str() {
            EVENT_DISPATCH_METHOD => AgentEvent::from_dispatch(request.params.as_ref()),
            CUSTOM_REQUEST_METHOD => AgentEvent::from_custom_request(request),
            other => {
                warn!(connection_id = %id, method = other, token = %request.id, "agent called unknown method");
                let reply = ResponseEnvelope::failure(
                    request.id.clone(),
                    RpcErrorObject::new(METHOD_NOT_FOUND, format!("method not found: {other}")),
                );
                if let Err(error) = self.reply(id, &reply) {
                    debug!(connection_id = %id, %error, "could not answer unknown method");
                }
                return;
            }
        };

        match parsed {
            Ok(event) => {
                let delivered = self.inner.events.publish(id, &event);
                debug!(connection_id = %id, event = %event.kind(), delivered, "event dispatched");
            }
            Err(error) => {
                counter!("helm_inbound_rejected_total").increment(1);
                warn!(connection_id = %id, method = %request.method, %error, "dropping malformed event");
            }
        }
    }

    // ── Outbound ──

    /// Send a request to `id` and wait for its response.
    ///
    /// Resolves to `Ok(None)` only when the result does not fit `T` and the
    /// call has no default.
    pub async fn call<T: DeserializeOwned>(&self, id: &ConnectionId, call: RpcCall<T>) -> Result<Option<T>> {
        let conn = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| BrokerError::NotConnected(id.clone()))?;
        let timeout = call.timeout.unwrap_or(self.inner.config.call_timeout);
        let method = call.method;

        // Registered before transmitting so a fast response cannot be missed.
        let (guard, rx) = self.inner.calls.register(id.clone(), &method);
        let request = RequestEnvelope::new(guard.token().clone(), method.clone(), call.params);
        let text = encode(&request)?;

        debug!(connection_id = %id, token = %guard.token(), %method, "sending call");
        counter!("helm_calls_total").increment(1);
        if !conn.send(text) {
            return Err(BrokerError::Transport(id.clone()));
        }
        drop(conn);

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(BrokerError::NotConnected(id.clone())),
            Err(_) => {
                counter!("helm_call_timeouts_total").increment(1);
                warn!(connection_id = %id, token = %guard.token(), %method, ?timeout, "call timed out");
                return Err(BrokerError::Timeout { method, timeout });
            }
        };
        drop(guard);

        if let Some(error) = response.error {
            debug!(connection_id = %id, %method, %error, "call failed remotely");
            return Err(error.into());
        }
        Ok(decode_result(response.result, call.default))
    }

    /// Send a request and wait for it to be acknowledged, ignoring the result.
    pub async fn call_ack(&self, id: &ConnectionId, method: &str, params: Vec<Value>) -> Result<()> {
        let _ = self.call::<IgnoredAny>(id, RpcCall::new(method, params)).await?;
        Ok(())
    }

    /// Queue an arbitrary JSON message for `id` without waiting.
    pub fn send_raw(&self, id: &ConnectionId, message: &Value) -> Result<()> {
        self.transmit(id, &encode(message)?)
    }

    /// Send a response envelope to `id`.
    pub fn reply(&self, id: &ConnectionId, response: &ResponseEnvelope) -> Result<()> {
        self.transmit(id, &encode(response)?)
    }

    fn transmit(&self, id: &ConnectionId, text: &str) -> Result<()> {
        let conn = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| BrokerError::NotConnected(id.clone()))?;
        if conn.send(text.to_owned()) {
            Ok(())
        } else {
            Err(BrokerError::Transport(id.clone()))
        }
    }

    // ── Listeners ──

    /// Append a listener for `kind` events on `id`.
    pub fn subscribe(&self, id: &ConnectionId, kind: EventKind, listener: Listener) {
        self.inner.events.subscribe(id, kind, listener);
    }

    /// Listeners registered for `id`.
    pub fn listener_count(&self, id: &ConnectionId) -> usize {
        self.inner.events.listener_count(id)
    }

    // ── Introspection ──

    /// Whether `id` has a live transport.
    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.inner.registry.is_live(id)
    }

    /// Whether anything is still recorded for `id`: a live transport,
    /// listeners, a pending cleanup, or a waiter.
    pub fn has_bookkeeping(&self, id: &ConnectionId) -> bool {
        self.inner.registry.is_live(id)
            || self.inner.events.contains(id)
            || self.inner.registry.has_cleanup(id)
            || self.inner.registry.has_waiter(id)
    }

    /// Snapshot of all live connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self
            .inner
            .registry
            .live_connections()
            .into_iter()
            .map(|conn| ConnectionInfo {
                id: conn.id.clone(),
                connected_at: conn.connected_at,
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Façades for all live connections.
    pub fn handles(&self) -> Vec<AgentHandle> {
        self.connections().into_iter().map(|info| self.handle(info.id)).collect()
    }

    /// Number of live connections.
    pub fn live_count(&self) -> usize {
        self.inner.registry.live_count()
    }

    /// Number of disconnected ids inside their grace window.
    pub fn dormant_count(&self) -> usize {
        self.inner.registry.dormant_count()
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.len()
    }
}

/// A registered wait for one connection id.
///
/// Dropping it unregisters the waiter.
pub struct PendingConnection {
    broker: Broker,
    id: ConnectionId,
    ticket: u64,
    rx: Option<oneshot::Receiver<()>>,
}

impl PendingConnection {
    /// The id being waited for.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Wait until the id is live.
    ///
    /// Resolves immediately if it already is.
    pub async fn wait(mut self, timeout: Duration) -> Result<AgentHandle> {
        if self.broker.is_connected(&self.id) {
            return Ok(self.broker.handle(self.id.clone()));
        }
        let Some(rx) = self.rx.take() else {
            return Err(BrokerError::ConnectTimeout {
                id: self.id.clone(),
                timeout,
            });
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(self.broker.handle(self.id.clone())),
            Ok(Err(_)) if self.broker.is_shutting_down() => Err(BrokerError::ShuttingDown),
            Ok(Err(_)) | Err(_) => {
                if self.broker.is_connected(&self.id) {
                    return Ok(self.broker.handle(self.id.clone()));
                }
                info!(connection_id = %self.id, ?timeout, "expected connection did not arrive");
                Err(BrokerError::ConnectTimeout {
                    id: self.id.clone(),
                    timeout,
                })
            }
        }
    }

    /// [`wait`](Self::wait) with the broker's configured connect timeout.
    pub async fn wait_default(self) -> Result<AgentHandle> {
        let timeout = self.broker.config().connect_timeout;
        self.wait(timeout).await
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        self.broker.inner.registry.remove_waiter(&self.id, self.ticket);
    }
}
