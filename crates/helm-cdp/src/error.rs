//! Protocol client error types.

use thiserror::Error;

/// Errors from discovery, connection, and command execution.
#[derive(Debug, Error)]
pub enum CdpError {
    /// The discovery endpoint listed no targets.
    #[error("no debuggable targets at {endpoint}")]
    NoTargets {
        /// Discovery URL that was queried.
        endpoint: String,
    },

    /// The discovery HTTP request failed or returned garbage.
    #[error("target discovery failed at {endpoint}: {reason}")]
    Discovery {
        /// Discovery URL that was queried.
        endpoint: String,
        /// Why it failed.
        reason: String,
    },

    /// Opening the socket to the selected target failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// Socket URL of the target.
        url: String,
        /// Why it failed.
        reason: String,
    },

    /// No response arrived before the command's deadline.
    #[error("command {method} timed out after {timeout_ms}ms")]
    CommandTimeout {
        /// Protocol method.
        method: String,
        /// How long we waited.
        timeout_ms: u64,
    },

    /// No matching event arrived before the deadline.
    #[error("timed out after {timeout_ms}ms waiting for event {method}")]
    EventTimeout {
        /// Event method being awaited.
        method: String,
        /// How long we waited.
        timeout_ms: u64,
    },

    /// The remote end answered with an error object.
    #[error("{method} failed: {message}")]
    Protocol {
        /// Protocol method.
        method: String,
        /// Error message reported by the remote end.
        message: String,
    },

    /// The page reported a navigation error.
    #[error("navigation failed for {url}: {reason}")]
    Navigation {
        /// Requested URL.
        url: String,
        /// Error text from the page.
        reason: String,
    },

    /// A script evaluation threw.
    #[error("evaluation failed: {message}")]
    Evaluation {
        /// Exception description.
        message: String,
    },

    /// The socket closed while the command was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The client was disconnected on purpose while the command was in flight.
    #[error("client disconnected")]
    Disconnected,

    /// A command was issued with no live connection.
    #[error("not connected")]
    NotConnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display() {
        let err = CdpError::CommandTimeout {
            method: "Page.navigate".into(),
            timeout_ms: 30_000,
        };
        assert_eq!(err.to_string(), "command Page.navigate timed out after 30000ms");
    }

    #[test]
    fn protocol_display() {
        let err = CdpError::Protocol {
            method: "Runtime.evaluate".into(),
            message: "Cannot find context".into(),
        };
        assert!(err.to_string().contains("Runtime.evaluate"));
        assert!(err.to_string().contains("Cannot find context"));
    }

    #[test]
    fn no_targets_display() {
        let err = CdpError::NoTargets {
            endpoint: "http://127.0.0.1:9222/json".into(),
        };
        assert!(err.to_string().contains("127.0.0.1:9222"));
    }

    #[test]
    fn unit_variants_display() {
        assert_eq!(CdpError::ConnectionClosed.to_string(), "connection closed");
        assert_eq!(CdpError::Disconnected.to_string(), "client disconnected");
        assert_eq!(CdpError::NotConnected.to_string(), "not connected");
    }
}
