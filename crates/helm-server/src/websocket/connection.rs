//! Transport handle for one live agent connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use helm_core::ConnectionId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The registry's handle on a connected agent's WebSocket.
///
/// Text queued with [`send`](Self::send) is written by the session's
/// outbound task. [`close`](Self::close) asks that task to send a Close
/// frame and stop.
#[derive(Debug)]
pub struct LiveConnection {
    /// Logical connection id.
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    closer: CancellationToken,
    /// Wall-clock time the transport was accepted.
    pub connected_at: DateTime<Utc>,
    accepted: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl LiveConnection {
    /// Create a handle around the session's outbound queue and close signal.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<String>, closer: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            closer,
            connected_at: Utc::now(),
            accepted: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a text frame.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped message counter.
    pub fn send(&self, text: String) -> bool {
        if self.tx.try_send(text).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Ask the session to close the transport.
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Whether a close was requested.
    pub fn is_closing(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Token the session watches for close requests.
    pub fn closer(&self) -> &CancellationToken {
        &self.closer
    }

    /// Mark the connection as alive (pong or any frame received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.accepted.elapsed()
    }
}
