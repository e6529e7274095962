//! Agent events and the in-process event bus.
//!
//! Components publish [`AgentEvent`]s to a single [`EventBus`] constructed by
//! the orchestrator and handed to each of them. The WebSocket layer subscribes
//! and turns each event into an [`EventEnvelope`] for observers.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Default buffered capacity of the event bus.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Every event type the control plane broadcasts to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BroadcastEventType {
    /// A scheduled or manual task finished successfully.
    #[serde(rename = "task:complete")]
    TaskComplete,
    /// A task's action handler failed.
    #[serde(rename = "task:error")]
    TaskError,
    /// A task/module was enabled.
    #[serde(rename = "module:enabled")]
    ModuleEnabled,
    /// A task/module was disabled.
    #[serde(rename = "module:disabled")]
    ModuleDisabled,
    /// The agent finished booting.
    #[serde(rename = "agent:started")]
    AgentStarted,
    /// The agent is shutting down.
    #[serde(rename = "agent:stopping")]
    AgentStopping,
    /// The agent has shut down.
    #[serde(rename = "agent:stopped")]
    AgentStopped,
    /// The browser debugging connection is up.
    #[serde(rename = "browser:connected")]
    BrowserConnected,
    /// The browser debugging connection dropped.
    #[serde(rename = "browser:disconnected")]
    BrowserDisconnected,
    /// Periodic liveness envelope from the hub.
    #[serde(rename = "agent:heartbeat")]
    AgentHeartbeat,
    /// An action is waiting for a human decision.
    #[serde(rename = "approval:requested")]
    ApprovalRequested,
    /// A pending approval was approved or rejected.
    #[serde(rename = "approval:resolved")]
    ApprovalResolved,
    /// Operator-visible error (e.g. reconnect attempts exhausted).
    #[serde(rename = "error")]
    Error,
}

impl BroadcastEventType {
    /// All known event types.
    pub const ALL: [Self; 13] = [
        Self::TaskComplete,
        Self::TaskError,
        Self::ModuleEnabled,
        Self::ModuleDisabled,
        Self::AgentStarted,
        Self::AgentStopping,
        Self::AgentStopped,
        Self::BrowserConnected,
        Self::BrowserDisconnected,
        Self::AgentHeartbeat,
        Self::ApprovalRequested,
        Self::ApprovalResolved,
        Self::Error,
    ];

    /// Wire name of the event type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskComplete => "task:complete",
            Self::TaskError => "task:error",
            Self::ModuleEnabled => "module:enabled",
            Self::ModuleDisabled => "module:disabled",
            Self::AgentStarted => "agent:started",
            Self::AgentStopping => "agent:stopping",
            Self::AgentStopped => "agent:stopped",
            Self::BrowserConnected => "browser:connected",
            Self::BrowserDisconnected => "browser:disconnected",
            Self::AgentHeartbeat => "agent:heartbeat",
            Self::ApprovalRequested => "approval:requested",
            Self::ApprovalResolved => "approval:resolved",
            Self::Error => "error",
        }
    }

    /// Look up an event type by wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for BroadcastEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound envelope sent to observers: `{type, data, timestamp}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event type name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub data: Value,
    /// ISO-8601 timestamp.
    pub timestamp: String,
}

impl EventEnvelope {
    /// Build an envelope stamped with the current time.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: iso_now(),
        }
    }
}

/// Current UTC time as an ISO-8601 string with millisecond precision.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// An event published on the bus.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentEvent {
    /// What happened.
    pub event_type: BroadcastEventType,
    /// Event payload.
    pub data: Value,
}

/// Process-wide fan-out of [`AgentEvent`]s.
///
/// Cloning the bus is cheap; all clones publish to the same channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Events published with no subscribers are dropped.
    pub fn emit(&self, event_type: BroadcastEventType, data: Value) {
        let receivers = self.tx.send(AgentEvent { event_type, data }).unwrap_or(0);
        trace!(event_type = %event_type, receivers, "event emitted");
    }

    /// Subscribe to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_wire_names_match_serde() {
        for t in BroadcastEventType::ALL {
            let serialized = serde_json::to_value(t).unwrap();
            assert_eq!(serialized, Value::String(t.as_str().into()));
        }
    }

    #[test]
    fn parse_roundtrips_known_names() {
        assert_eq!(
            BroadcastEventType::parse("task:complete"),
            Some(BroadcastEventType::TaskComplete)
        );
        assert_eq!(
            BroadcastEventType::parse("agent:heartbeat"),
            Some(BroadcastEventType::AgentHeartbeat)
        );
        assert_eq!(BroadcastEventType::parse("nope"), None);
    }

    #[test]
    fn envelope_serializes_with_type_key() {
        let env = EventEnvelope::new("task:complete", json!({"task": "t1"}));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "task:complete");
        assert_eq!(v["data"]["task"], "t1");
        assert!(v["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn bus_delivers_to_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(BroadcastEventType::AgentStarted, json!({}));

        assert_eq!(a.recv().await.unwrap().event_type, BroadcastEventType::AgentStarted);
        assert_eq!(b.recv().await.unwrap().event_type, BroadcastEventType::AgentStarted);
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.emit(BroadcastEventType::Error, json!({"message": "x"}));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
