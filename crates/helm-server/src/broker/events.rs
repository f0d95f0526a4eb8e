//! Per-connection event listeners.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::DashMap;
use helm_core::ConnectionId;
use helm_rpc::{AgentEvent, EventKind};
use metrics::counter;
use parking_lot::RwLock;
use tracing::error;

/// A registered event callback.
pub type Listener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerSet {
    by_kind: RwLock<HashMap<EventKind, Vec<Listener>>>,
}

/// Connection id → event kind → listeners in subscription order.
///
/// Listener sets live as long as the connection's bookkeeping, including
/// the dormant grace window.
#[derive(Default)]
pub struct EventBus {
    sets: DashMap<ConnectionId, Arc<ListenerSet>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener for `kind` on `connection_id`.
    pub fn subscribe(&self, connection_id: &ConnectionId, kind: EventKind, listener: Listener) {
        let set = Arc::clone(&self.sets.entry(connection_id.clone()).or_default());
        set.by_kind.write().entry(kind).or_default().push(listener);
    }

    /// Deliver `event` to every listener for its kind, in subscription order.
    ///
    /// A panicking listener is logged and skipped. Listeners registered while
    /// a publish is running see the next event, not this one. Returns the
    /// number of listeners invoked.
    pub fn publish(&self, connection_id: &ConnectionId, event: &AgentEvent) -> usize {
        let Some(set) = self.sets.get(connection_id).map(|s| Arc::clone(&s)) else {
            return 0;
        };
        let kind = event.kind();
        let listeners = set.by_kind.read().get(&kind).cloned().unwrap_or_default();

        for (index, listener) in listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                counter!("helm_listener_failures_total").increment(1);
                error!(%connection_id, event = %kind, index, "event listener panicked");
            }
        }
        listeners.len()
    }

    /// Drop every listener for `connection_id`.
    pub fn remove(&self, connection_id: &ConnectionId) -> bool {
        self.sets.remove(connection_id).is_some()
    }

    /// Whether any listener set exists for `connection_id`.
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.sets.contains_key(connection_id)
    }

    /// Total listeners registered for `connection_id` across all kinds.
    pub fn listener_count(&self, connection_id: &ConnectionId) -> usize {
        self.sets
            .get(connection_id)
            .map_or(0, |set| set.by_kind.read().values().map(Vec::len).sum())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use helm_core::logging::capture_logs;
    use parking_lot::Mutex;
    use tracing::Level;

    use super::*;

    fn id() -> ConnectionId {
        ConnectionId::from("abc")
    }

    fn listener(f: impl Fn(&AgentEvent) + Send + Sync + 'static) -> Listener {
        Arc::new(f)
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe(&id(), EventKind::Banned, listener(move |_| order.lock().push(n)));
        }
        assert_eq!(bus.publish(&id(), &AgentEvent::Banned), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn only_matching_kind_is_invoked() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe(&id(), EventKind::ScriptEnded, listener(move |_| {
            let _ = h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(bus.publish(&id(), &AgentEvent::Banned), 0);
        assert_eq!(bus.publish(&id(), &AgentEvent::ScriptEnded), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_is_isolated_and_logged() {
        let (logs, _guard) = capture_logs();
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));
        bus.subscribe(&id(), EventKind::Custom, listener(|_| panic!("listener blew up")));
        let r = Arc::clone(&reached);
        bus.subscribe(&id(), EventKind::Custom, listener(move |_| {
            let _ = r.fetch_add(1, Ordering::SeqCst);
        }));

        let delivered = bus.publish(&id(), &AgentEvent::Custom { message: "hi".into() });
        assert_eq!(delivered, 2);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
        assert!(logs.has_event(Level::ERROR, "event listener panicked"));
    }

    #[test]
    fn listener_may_subscribe_during_publish() {
        let bus = Arc::new(EventBus::new());
        let inner_bus = Arc::clone(&bus);
        bus.subscribe(&id(), EventKind::Banned, listener(move |_| {
            inner_bus.subscribe(&id(), EventKind::Banned, listener(|_| {}));
        }));
        assert_eq!(bus.publish(&id(), &AgentEvent::Banned), 1);
        assert_eq!(bus.listener_count(&id()), 2);
    }

    #[test]
    fn remove_clears_all_kinds() {
        let bus = EventBus::new();
        bus.subscribe(&id(), EventKind::Banned, listener(|_| {}));
        bus.subscribe(&id(), EventKind::Disconnected, listener(|_| {}));
        assert_eq!(bus.listener_count(&id()), 2);
        assert!(bus.remove(&id()));
        assert!(!bus.contains(&id()));
        assert_eq!(bus.listener_count(&id()), 0);
        assert_eq!(bus.publish(&id(), &AgentEvent::Banned), 0);
    }

    #[test]
    fn publish_to_unknown_connection_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(&ConnectionId::from("ghost"), &AgentEvent::Disconnected), 0);
    }
}
