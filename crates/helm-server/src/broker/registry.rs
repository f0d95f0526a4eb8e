//! Live transports, connection waiters, and scheduled cleanups.
//!
//! Independent concurrent maps keyed by connection id. When a cleanup fires
//! it holds its own `cleanups` entry while it re-checks `live` and discards
//! listeners; no other path acquires a `cleanups` entry while holding an
//! entry in another map.
//!
//! Lifecycle transitions for one id (accept, disconnect) run under that id's
//! gate, so a reconnect can never observe the gap between the transport
//! leaving `live` and its cleanup being recorded. Gates hold no map locks
//! while taken.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use helm_core::ConnectionId;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::websocket::connection::LiveConnection;

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<()>,
}

struct CleanupTask {
    generation: u64,
    handle: AbortHandle,
}

/// Connection bookkeeping owned by the broker.
#[derive(Default)]
pub(crate) struct Registry {
    live: DashMap<ConnectionId, Arc<LiveConnection>>,
    waiters: DashMap<ConnectionId, Vec<Waiter>>,
    cleanups: DashMap<ConnectionId, CleanupTask>,
    gates: DashMap<ConnectionId, Arc<Mutex<()>>>,
    sequence: AtomicU64,
}

impl Registry {
    /// Transition gate for `id`, created on first use.
    pub(crate) fn gate(&self, id: &ConnectionId) -> Arc<Mutex<()>> {
        Arc::clone(&self.gates.entry(id.clone()).or_default())
    }

    /// Forget `id`'s gate if nobody else holds or waits on it.
    pub(crate) fn release_gate(&self, id: &ConnectionId) {
        let _ = self.gates.remove_if(id, |_, gate| Arc::strong_count(gate) == 1);
    }

    /// Insert a live transport unless the id already has one.
    pub(crate) fn insert_live(&self, conn: Arc<LiveConnection>) -> bool {
        match self.live.entry(conn.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let _ = slot.insert(conn);
                true
            }
        }
    }

    /// Remove `conn` if it is still the live transport for its id.
    pub(crate) fn remove_live(&self, conn: &Arc<LiveConnection>) -> bool {
        self.live
            .remove_if(&conn.id, |_, current| Arc::ptr_eq(current, conn))
            .is_some()
    }

    pub(crate) fn get(&self, id: &ConnectionId) -> Option<Arc<LiveConnection>> {
        self.live.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn is_live(&self, id: &ConnectionId) -> bool {
        self.live.contains_key(id)
    }

    pub(crate) fn live_connections(&self) -> Vec<Arc<LiveConnection>> {
        self.live.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Register a single-shot waiter for `id`.
    pub(crate) fn add_waiter(&self, id: ConnectionId) -> (u64, oneshot::Receiver<()>) {
        let ticket = self.sequence.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(id).or_default().push(Waiter { ticket, tx });
        (ticket, rx)
    }

    /// Signal and remove every waiter for `id`. Returns how many were woken.
    pub(crate) fn signal_waiters(&self, id: &ConnectionId) -> usize {
        self.waiters.remove(id).map_or(0, |(_, waiters)| {
            waiters
                .into_iter()
                .map(|waiter| waiter.tx.send(()))
                .filter(Result::is_ok)
                .count()
        })
    }

    /// Remove the waiter holding `ticket`.
    pub(crate) fn remove_waiter(&self, id: &ConnectionId, ticket: u64) {
        if let Entry::Occupied(mut entry) = self.waiters.entry(id.clone()) {
            entry.get_mut().retain(|waiter| waiter.ticket != ticket);
            if entry.get().is_empty() {
                let _ = entry.remove();
            }
        }
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub(crate) fn clear_waiters(&self) {
        self.waiters.clear();
    }

    /// Next cleanup generation number.
    pub(crate) fn next_generation(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Record the cleanup task for `id`, aborting any task it replaces.
    pub(crate) fn install_cleanup(&self, id: ConnectionId, generation: u64, handle: AbortHandle) {
        if let Some(previous) = self.cleanups.insert(id, CleanupTask { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel the pending cleanup for `id`. Returns `true` if one existed.
    pub(crate) fn cancel_cleanup(&self, id: &ConnectionId) -> bool {
        match self.cleanups.remove(id) {
            Some((_, task)) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Run the cleanup of generation `generation` for `id`.
    ///
    /// No-op when a newer cleanup replaced this one, the cleanup was
    /// cancelled, or the id is live again. `discard` runs while the entry is
    /// held, so a concurrent reconnect waits for it to finish. Waiters are
    /// left alone; each belongs to its `PendingConnection`.
    pub(crate) fn fire_cleanup(&self, id: &ConnectionId, generation: u64, discard: impl FnOnce()) -> bool {
        let Entry::Occupied(entry) = self.cleanups.entry(id.clone()) else {
            return false;
        };
        if entry.get().generation != generation {
            return false;
        }
        // A reconnect that beat us here still owns the entry and cancels it.
        if self.live.contains_key(id) {
            return false;
        }
        discard();
        let _ = entry.remove();
        true
    }

    pub(crate) fn has_cleanup(&self, id: &ConnectionId) -> bool {
        self.cleanups.contains_key(id)
    }

    pub(crate) fn has_waiter(&self, id: &ConnectionId) -> bool {
        self.waiters.contains_key(id)
    }

    pub(crate) fn dormant_count(&self) -> usize {
        self.cleanups.len()
    }

    /// Abort every scheduled cleanup.
    pub(crate) fn abort_cleanups(&self) {
        self.cleanups.retain(|_, task| {
            task.handle.abort();
            false
        });
    }
}
