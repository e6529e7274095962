//! Publishes browser client lifecycle on the agent bus.

use helm_cdp::ClientEvent;
use helm_core::{BroadcastEventType, EventBus};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Forward [`ClientEvent`]s until `cancel` fires or the client is dropped.
pub async fn run_browser_bridge(
    mut rx: broadcast::Receiver<ClientEvent>,
    bus: EventBus,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            () = cancel.cancelled() => break,
        };
        match event {
            Ok(event) => publish(&bus, event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(lagged = n, "browser bridge lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn publish(bus: &EventBus, event: ClientEvent) {
    match event {
        ClientEvent::Connected { url } => {
            bus.emit(BroadcastEventType::BrowserConnected, json!({ "url": url }));
        }
        ClientEvent::Disconnected => {
            bus.emit(BroadcastEventType::BrowserDisconnected, json!({}));
        }
        ClientEvent::Fatal { attempts } => {
            bus.emit(
                BroadcastEventType::Error,
                json!({
                    "source": "browser",
                    "message": format!("browser reconnect failed after {attempts} attempts"),
                    "attempts": attempts,
                }),
            );
        }
        ClientEvent::Reconnecting { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "browser reconnect scheduled");
        }
        ClientEvent::Error { message } => {
            warn!(%message, "browser reconnect attempt failed");
        }
        ClientEvent::Protocol { method, .. } => {
            debug!(%method, "browser protocol event");
        }
    }
}
