//! Inbound control messages from observers.
//!
//! ```json
//! {"type": "subscribe", "events": ["task:complete"]}
//! {"type": "unsubscribe", "events": ["task:complete"]}
//! {"type": "ping"}
//! ```

use serde::Deserialize;

/// A parsed control message.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Add event types to the connection's filter.
    Subscribe {
        /// Event type names.
        #[serde(default)]
        events: Vec<String>,
    },
    /// Remove event types from the connection's filter.
    Unsubscribe {
        /// Event type names.
        #[serde(default)]
        events: Vec<String>,
    },
    /// Liveness check; answered with a `pong` envelope.
    Ping,
}

/// Parse a text frame. Returns `None` for anything that is not a known
/// control message.
pub fn parse_control(text: &str) -> Option<ControlMessage> {
    serde_json::from_str(text).ok()
}
