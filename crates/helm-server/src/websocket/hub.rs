//! Event fan-out to connected observers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::close_code;
use helm_core::events::iso_now;
use helm_core::{AgentEvent, BroadcastEventType, EventEnvelope};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{ClientConnection, Outbound};
use super::heartbeat::run_heartbeat;
use super::protocol::{ControlMessage, parse_control};

/// Registry of observer connections plus the hub-wide heartbeat.
pub struct EventHub {
    connections: RwLock<HashMap<String, Arc<ClientConnection>>>,
    send_queue_size: usize,
    started_at: Instant,
    closed: AtomicBool,
    heartbeat_cancel: CancellationToken,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventHub {
    /// Create a hub whose connections buffer up to `send_queue_size` frames.
    pub fn new(send_queue_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            send_queue_size: send_queue_size.max(1),
            started_at: Instant::now(),
            closed: AtomicBool::new(false),
            heartbeat_cancel: CancellationToken::new(),
            heartbeat_task: Mutex::new(None),
        }
    }

    /// Register a new observer and queue its welcome envelope.
    ///
    /// The returned receiver feeds the connection's write task. After
    /// [`close`](Self::close) the connection is handed back already closed.
    pub fn register(&self, ip: Option<IpAddr>) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.send_queue_size);
        let id = format!("client_{}", uuid::Uuid::now_v7().simple());
        let connection = Arc::new(ClientConnection::new(id.clone(), ip, tx));

        if self.closed.load(Ordering::Acquire) {
            connection.close(close_code::AWAY);
            return (connection, rx);
        }

        let welcome = EventEnvelope::new(
            "connected",
            json!({ "clientId": id, "serverTime": iso_now() }),
        );
        let _ = connection.send_json(&welcome);

        let total = {
            let mut conns = self.connections.write();
            let _ = conns.insert(id.clone(), connection.clone());
            conns.len()
        };
        info!(client_id = %id, ip = ?ip, connections = total, "observer connected");
        (connection, rx)
    }

    /// Forget a connection.
    pub fn unregister(&self, connection_id: &str) {
        if self.connections.write().remove(connection_id).is_some() {
            debug!(client_id = connection_id, "observer removed");
        }
    }

    /// Apply one inbound text frame from `connection`.
    pub fn handle_control(&self, connection: &ClientConnection, text: &str) {
        match parse_control(text) {
            Some(ControlMessage::Subscribe { events }) => {
                debug!(client_id = %connection.id, ?events, "subscribe");
                connection.subscribe(events);
            }
            Some(ControlMessage::Unsubscribe { events }) => {
                debug!(client_id = %connection.id, ?events, "unsubscribe");
                connection.unsubscribe(&events);
            }
            Some(ControlMessage::Ping) => {
                let _ = connection.send_json(&json!({ "type": "pong", "timestamp": iso_now() }));
            }
            None => {
                let preview: String = text.chars().take(120).collect();
                warn!(client_id = %connection.id, message = %preview, "ignoring unrecognized message");
            }
        }
    }

    /// Deliver an envelope to every open connection that wants `event_type`.
    ///
    /// Returns the number of connections the frame was queued for.
    pub fn broadcast(&self, event_type: &str, data: Value) -> usize {
        let envelope = EventEnvelope::new(event_type, data);
        let frame = match serde_json::to_string(&envelope) {
            Ok(json) => Outbound::Text(json.into()),
            Err(e) => {
                warn!(event_type, error = %e, "failed to serialize event");
                return 0;
            }
        };

        let conns = self.connections.read();
        let mut delivered = 0;
        for conn in conns.values() {
            if !conn.is_open() || !conn.wants(event_type) {
                continue;
            }
            if conn.send(frame.clone()) {
                delivered += 1;
            } else {
                debug!(client_id = %conn.id, event_type, "observer queue full, event dropped");
            }
        }
        debug!(event_type, recipients = delivered, "broadcast event");
        delivered
    }

    /// Broadcast an event published on the bus.
    pub fn broadcast_event(&self, event: &AgentEvent) -> usize {
        self.broadcast(event.event_type.as_str(), event.data.clone())
    }

    /// One heartbeat sweep.
    ///
    /// Connections that did not answer the previous ping are terminated and
    /// removed, the rest are pinged, then `agent:heartbeat` goes out. Returns
    /// the number of connections pruned.
    pub fn heartbeat_tick(&self) -> usize {
        let dead: Vec<Arc<ClientConnection>> = {
            let mut conns = self.connections.write();
            let dead_ids: Vec<String> = conns
                .values()
                .filter(|c| !c.check_alive() || !c.is_open())
                .map(|c| c.id.clone())
                .collect();
            dead_ids.iter().filter_map(|id| conns.remove(id)).collect()
        };
        for conn in &dead {
            info!(client_id = %conn.id, age_secs = conn.age().as_secs(), "terminating unresponsive observer");
            conn.terminate();
        }
        if !dead.is_empty() {
            counter!("ws_heartbeat_terminations_total").increment(dead.len() as u64);
        }

        let remaining = {
            let conns = self.connections.read();
            for conn in conns.values() {
                let _ = conn.send(Outbound::Ping);
            }
            conns.len()
        };

        let _ = self.broadcast(
            BroadcastEventType::AgentHeartbeat.as_str(),
            json!({
                "connections": remaining,
                "uptime": self.uptime().as_secs(),
            }),
        );
        dead.len()
    }

    /// Start the periodic heartbeat. Calling this twice is a no-op.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let mut slot = self.heartbeat_task.lock();
        if slot.is_some() || self.closed.load(Ordering::Acquire) {
            return;
        }
        let interval = interval.max(Duration::from_millis(1));
        *slot = Some(tokio::spawn(run_heartbeat(
            Arc::downgrade(self),
            interval,
            self.heartbeat_cancel.clone(),
        )));
    }

    /// Stop the heartbeat, close every connection with 1001, and clear the
    /// registry.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.heartbeat_cancel.cancel();
        if let Some(task) = self.heartbeat_task.lock().take() {
            task.abort();
        }
        let drained: Vec<Arc<ClientConnection>> =
            self.connections.write().drain().map(|(_, c)| c).collect();
        for conn in &drained {
            conn.close(close_code::AWAY);
        }
        info!(closed = drained.len(), "event hub closed");
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Look up a connection by ID.
    pub fn connection(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(connection_id).cloned()
    }

    /// Time since the hub was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(frame: Outbound) -> Value {
        match frame {
            Outbound::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
            Outbound::Ping => panic!("expected text frame, got ping"),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn types(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        drain(rx)
            .into_iter()
            .filter(|f| matches!(f, Outbound::Text(_)))
            .map(|f| text(f)["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn register_sends_welcome() {
        let hub = EventHub::default();
        let (conn, mut rx) = hub.register(None);
        let welcome = text(rx.try_recv().unwrap());
        assert_eq!(welcome["type"], "connected");
        assert_eq!(welcome["data"]["clientId"], conn.id.as_str());
        assert!(welcome["timestamp"].is_string());
        assert_eq!(hub.connection_count(), 1);
        assert!(conn.subscriptions().is_empty());
    }

    #[test]
    fn broadcast_respects_filters() {
        let hub = EventHub::default();
        let (all, mut all_rx) = hub.register(None);
        let (only, mut only_rx) = hub.register(None);
        let _ = drain(&mut all_rx);
        let _ = drain(&mut only_rx);

        hub.handle_control(&only, r#"{"type":"subscribe","events":["task:complete"]}"#);
        assert_eq!(hub.broadcast("task:complete", json!({"task": "t"})), 2);
        assert_eq!(hub.broadcast("task:error", json!({"task": "t"})), 1);

        assert_eq!(types(&mut all_rx), ["task:complete", "task:error"]);
        assert_eq!(types(&mut only_rx), ["task:complete"]);
        assert!(all.is_open());
    }

    #[test]
    fn envelope_shape() {
        let hub = EventHub::default();
        let (_conn, mut rx) = hub.register(None);
        let _ = drain(&mut rx);
        let _ = hub.broadcast("module:enabled", json!({"task": "reload"}));
        let env = text(rx.try_recv().unwrap());
        assert_eq!(env["type"], "module:enabled");
        assert_eq!(env["data"]["task"], "reload");
        assert!(env["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn ping_gets_pong() {
        let hub = EventHub::default();
        let (conn, mut rx) = hub.register(None);
        let _ = drain(&mut rx);
        hub.handle_control(&conn, r#"{"type":"ping"}"#);
        let pong = text(rx.try_recv().unwrap());
        assert_eq!(pong["type"], "pong");
        assert!(pong["timestamp"].is_string());
    }

    #[test]
    fn garbage_is_ignored() {
        let hub = EventHub::default();
        let (conn, mut rx) = hub.register(None);
        let _ = drain(&mut rx);
        hub.handle_control(&conn, "{{{");
        hub.handle_control(&conn, r#"{"type":"shutdown"}"#);
        assert!(drain(&mut rx).is_empty());
        assert!(conn.is_open());
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn closed_connections_are_skipped() {
        let hub = EventHub::default();
        let (_a, a_rx) = hub.register(None);
        let (_b, mut b_rx) = hub.register(None);
        drop(a_rx);
        let _ = drain(&mut b_rx);
        assert_eq!(hub.broadcast("agent:started", json!({})), 1);
    }

    #[test]
    fn heartbeat_prunes_silent_connections() {
        let hub = EventHub::default();
        let (quiet, mut quiet_rx) = hub.register(None);
        let (chatty, mut chatty_rx) = hub.register(None);

        // First sweep: both were alive at registration.
        assert_eq!(hub.heartbeat_tick(), 0);
        let frames = drain(&mut chatty_rx);
        assert!(frames.contains(&Outbound::Ping));
        let _ = drain(&mut quiet_rx);

        chatty.mark_alive();
        assert_eq!(hub.heartbeat_tick(), 1);
        assert_eq!(hub.connection_count(), 1);
        assert!(hub.connection(&chatty.id).is_some());
        assert!(!quiet.is_open());
        assert_eq!(quiet.close_code(), None);

        let heartbeat = drain(&mut chatty_rx)
            .into_iter()
            .filter(|f| matches!(f, Outbound::Text(_)))
            .map(text)
            .find(|v| v["type"] == "agent:heartbeat")
            .unwrap();
        assert_eq!(heartbeat["data"]["connections"], 1);
        assert!(heartbeat["data"]["uptime"].is_u64());
    }

    #[test]
    fn close_sends_going_away_and_clears() {
        let hub = EventHub::default();
        let (a, _a_rx) = hub.register(None);
        let (b, _b_rx) = hub.register(None);
        hub.close();

        assert!(hub.is_closed());
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(a.close_code(), Some(close_code::AWAY));
        assert_eq!(b.close_code(), Some(1001));
        assert_eq!(hub.broadcast("agent:stopped", json!({})), 0);

        let (late, _late_rx) = hub.register(None);
        assert!(!late.is_open());
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn bus_events_use_wire_names() {
        let hub = EventHub::default();
        let (_conn, mut rx) = hub.register(None);
        let _ = drain(&mut rx);
        let event = AgentEvent {
            event_type: BroadcastEventType::BrowserConnected,
            data: json!({"url": "ws://x"}),
        };
        assert_eq!(hub.broadcast_event(&event), 1);
        assert_eq!(types(&mut rx), ["browser:connected"]);
    }
}
