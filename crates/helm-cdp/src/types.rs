//! Types shared by the discovery client and the protocol client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of the discovery endpoint's target list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    /// Target ID.
    pub id: String,
    /// Target kind (`"page"`, `"service_worker"`, ...).
    #[serde(rename = "type")]
    pub target_type: String,
    /// Page title.
    #[serde(default)]
    pub title: String,
    /// Current URL.
    #[serde(default)]
    pub url: String,
    /// Socket URL for the command protocol. Absent when another client is attached.
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

impl TargetInfo {
    /// Whether this target is a regular page.
    pub fn is_page(&self) -> bool {
        self.target_type == "page"
    }
}

/// Lifecycle and protocol notifications published by the client.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// A socket to `url` is open and ready for commands.
    Connected {
        /// Socket URL of the attached target.
        url: String,
    },
    /// The socket closed, on purpose or not.
    Disconnected,
    /// A reconnect attempt failed.
    Error {
        /// Failure description.
        message: String,
    },
    /// A reconnect is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// Reconnect attempts are exhausted; the client will not retry.
    Fatal {
        /// Number of attempts made.
        attempts: u32,
    },
    /// Unsolicited protocol event (a message with `method` and no `id`).
    Protocol {
        /// Event method, e.g. `Page.loadEventFired`.
        method: String,
        /// Event parameters.
        params: Value,
    },
}

/// Connection and retry parameters.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Debugging endpoint host.
    pub host: String,
    /// Debugging endpoint port.
    pub port: u16,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound on the reconnect delay.
    pub max_delay: Duration,
    /// Default per-command deadline.
    pub command_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9222,
            max_reconnect_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
        }
    }
}
