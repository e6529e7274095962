//! Event bridge: forwards [`AgentEvent`]s from the bus to observers.

use std::sync::Arc;

use helm_core::AgentEvent;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::hub::EventHub;

/// Bridges bus events to WebSocket observers.
pub struct EventBridge {
    rx: broadcast::Receiver<AgentEvent>,
    hub: Arc<EventHub>,
}

impl EventBridge {
    /// Create a new event bridge.
    pub fn new(rx: broadcast::Receiver<AgentEvent>, hub: Arc<EventHub>) -> Self {
        Self { rx, hub }
    }

    /// Run the bridge loop. Exits when every bus sender is dropped or the hub
    /// has been closed.
    pub async fn run(self) {
        self.run_until(CancellationToken::new()).await;
    }

    /// Like [`run`](Self::run), but also stops on `cancel`. Events already
    /// published when `cancel` fires are still delivered.
    #[tracing::instrument(skip_all, name = "event_bridge")]
    pub async fn run_until(mut self, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                received = self.rx.recv() => received,
                () = cancel.cancelled() => {
                    self.drain();
                    break;
                }
            };
            match received {
                Ok(event) => {
                    if self.hub.is_closed() {
                        break;
                    }
                    self.forward(&event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "event bridge lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event bus closed, bridge exiting");
                    break;
                }
            }
        }
    }

    fn forward(&self, event: &AgentEvent) {
        tracing::debug!(event_type = %event.event_type, "bridging event to observers");
        let _ = self.hub.broadcast_event(event);
    }

    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(event) => self.forward(&event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "event bridge lagged");
                }
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::{BroadcastEventType, EventBus};
    use serde_json::json;

    use crate::websocket::connection::Outbound;

    #[tokio::test]
    async fn forwards_bus_events() {
        let bus = EventBus::default();
        let hub = Arc::new(EventHub::default());
        let (_conn, mut rx) = hub.register(None);
        let _ = rx.recv().await; // welcome

        let task = tokio::spawn(EventBridge::new(bus.subscribe(), hub.clone()).run());
        bus.emit(BroadcastEventType::TaskComplete, json!({"task": "reload"}));

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        let env: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(env["type"], "task:complete");
        assert_eq!(env["data"]["task"], "reload");

        drop(bus);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stops_after_hub_closes() {
        let bus = EventBus::default();
        let hub = Arc::new(EventHub::default());
        let task = tokio::spawn(EventBridge::new(bus.subscribe(), hub.clone()).run());

        hub.close();
        bus.emit(BroadcastEventType::AgentStopped, json!({}));
        task.await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn cancel_flushes_already_published_events() {
        let bus = EventBus::default();
        let hub = Arc::new(EventHub::default());
        let (_conn, mut rx) = hub.register(None);
        let _ = rx.recv().await; // welcome

        let bridge = EventBridge::new(bus.subscribe(), hub.clone());
        bus.emit(BroadcastEventType::AgentStopping, json!({}));
        bus.emit(BroadcastEventType::AgentStopped, json!({}));
        let cancel = CancellationToken::new();
        cancel.cancel();
        bridge.run_until(cancel).await;

        let mut seen = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            let env: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            seen.push(env["type"].as_str().unwrap().to_string());
        }
        assert_eq!(seen, ["agent:stopping", "agent:stopped"]);
    }
}
