//! `/health` endpoint.

use serde::Serialize;
use std::time::Duration;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current observer connection count.
    pub connections: usize,
}

/// Build a health response from live counters.
pub fn health_check(uptime: Duration, connections: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: uptime.as_secs(),
        connections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        assert_eq!(health_check(Duration::ZERO, 0).status, "ok");
    }

    #[test]
    fn uptime_is_whole_seconds() {
        let resp = health_check(Duration::from_millis(61_900), 3);
        assert_eq!(resp.uptime_secs, 61);
        assert_eq!(resp.connections, 3);
    }

    #[test]
    fn serializes_snake_case_fields() {
        let json = serde_json::to_value(health_check(Duration::from_secs(5), 2)).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["uptime_secs"], 5);
        assert_eq!(json["connections"], 2);
    }
}
