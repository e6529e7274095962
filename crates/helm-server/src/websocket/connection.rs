//! Observer connection state.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::Utf8Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Frames queued for a connection's write task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized envelope, shared across recipients.
    Text(Utf8Bytes),
    /// A liveness check.
    Ping,
}

/// One connected observer.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: String,
    /// Remote address, when known.
    pub ip: Option<IpAddr>,
    /// When this connection was established.
    pub connected_at: Instant,
    tx: mpsc::Sender<Outbound>,
    /// Event types this observer wants. Empty means everything.
    subscriptions: RwLock<HashSet<String>>,
    is_alive: AtomicBool,
    dropped_messages: AtomicU64,
    shutdown: CancellationToken,
    close_code: Mutex<Option<u16>>,
}

impl ClientConnection {
    /// Create a new connection feeding `tx`.
    pub fn new(id: String, ip: Option<IpAddr>, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            ip,
            connected_at: Instant::now(),
            tx,
            subscriptions: RwLock::new(HashSet::new()),
            is_alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            close_code: Mutex::new(None),
        }
    }

    /// Queue a frame. Returns `false` when the queue is full or the
    /// connection has gone away.
    pub fn send(&self, message: Outbound) -> bool {
        if !self.is_open() {
            return false;
        }
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize `value` and queue it as a text frame.
    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Outbound::Text(json.into())),
            Err(_) => false,
        }
    }

    /// Whether frames can still be delivered.
    pub fn is_open(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.tx.is_closed()
    }

    /// Add event types to the subscription set.
    pub fn subscribe<I, S>(&self, events: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut subs = self.subscriptions.write();
        subs.extend(events.into_iter().map(Into::into));
    }

    /// Remove event types from the subscription set.
    pub fn unsubscribe<I, S>(&self, events: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut subs = self.subscriptions.write();
        for event in events {
            let _ = subs.remove(event.as_ref());
        }
    }

    /// Current subscriptions, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut subs: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        subs.sort();
        subs
    }

    /// Whether an event of `event_type` should be delivered here.
    pub fn wants(&self, event_type: &str) -> bool {
        let subs = self.subscriptions.read();
        subs.is_empty() || subs.contains(event_type)
    }

    /// Record a pong (or any sign of life).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Read and clear the alive flag.
    ///
    /// Returns `true` if the connection showed signs of life since the last
    /// check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Close with a close frame carrying `code`.
    pub fn close(&self, code: u16) {
        *self.close_code.lock() = Some(code);
        self.shutdown.cancel();
    }

    /// Drop the connection without a close frame.
    pub fn terminate(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once [`close`](Self::close) or [`terminate`](Self::terminate)
    /// has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// The close code requested by [`close`](Self::close), if any.
    pub fn close_code(&self) -> Option<u16> {
        *self.close_code.lock()
    }

    /// Frames dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
