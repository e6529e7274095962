//! Settings types.
//!
//! Every section uses `#[serde(default)]` so a settings file only needs the
//! keys it overrides.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelmSettings {
    /// Observer WebSocket server.
    pub server: ServerSettings,
    /// Remote debugging endpoint and reconnection policy.
    pub browser: BrowserSettings,
    /// Token-bucket limits keyed by action type.
    pub rate_limits: BTreeMap<String, RateLimitSettings>,
    /// Dry-run and approval gates.
    pub safety: SafetySettings,
    /// Scheduled tasks.
    pub tasks: Vec<TaskSettings>,
    /// Persistence.
    pub database: DatabaseSettings,
    /// Logging.
    pub logging: LoggingSettings,
}

/// Observer WebSocket server settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` = auto-assign).
    pub port: u16,
    /// Seconds between heartbeat sweeps.
    pub heartbeat_interval_secs: u64,
    /// Per-connection outbound queue depth.
    pub send_queue_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            heartbeat_interval_secs: 30,
            send_queue_size: 256,
        }
    }
}

/// Remote debugging endpoint settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserSettings {
    /// Debugging endpoint host.
    pub host: String,
    /// Debugging endpoint port.
    pub port: u16,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay in milliseconds.
    pub base_delay_ms: u64,
    /// Reconnect delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Default per-command timeout in milliseconds.
    pub command_timeout_ms: u64,
    /// Connect on startup.
    pub auto_connect: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9222,
            max_reconnect_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            command_timeout_ms: 30_000,
            auto_connect: true,
        }
    }
}

/// Limit for one action type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSettings {
    /// Bucket capacity (actions per window).
    pub max: u32,
    /// Window length in minutes.
    pub window_minutes: u64,
}

impl RateLimitSettings {
    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_minutes.saturating_mul(60_000)
    }
}

/// Dry-run and approval settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SafetySettings {
    /// Simulate side-effecting actions instead of running them.
    pub dry_run: bool,
    /// Human approval gate.
    pub approval: ApprovalSettings,
}

/// Approval gate settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApprovalSettings {
    /// Require approval at all.
    pub enabled: bool,
    /// Action types that need approval. Empty means every action type.
    pub action_types: Vec<String>,
}

impl ApprovalSettings {
    /// Whether `action_type` must wait for a human decision.
    pub fn requires(&self, action_type: &str) -> bool {
        self.enabled
            && (self.action_types.is_empty() || self.action_types.iter().any(|t| t == action_type))
    }
}

/// One scheduled task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSettings {
    /// Unique task name.
    pub name: String,
    /// Module that handles the task.
    pub module: String,
    /// Action within the module.
    pub action: String,
    /// Cron expression (5, 6, or 7 fields).
    pub cron: String,
    /// Register the task on start.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

fn default_true() -> bool {
    true
}

/// Persistence settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// `SQLite` file path; `":memory:"` for an ephemeral store.
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "helm.db".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = HelmSettings::default();
        assert_eq!(s.server.port, 3001);
        assert_eq!(s.server.heartbeat_interval_secs, 30);
        assert_eq!(s.browser.port, 9222);
        assert_eq!(s.browser.max_reconnect_attempts, 5);
        assert_eq!(s.browser.command_timeout_ms, 30_000);
        assert!(!s.safety.dry_run);
        assert!(s.tasks.is_empty());
        assert!(s.rate_limits.is_empty());
    }

    #[test]
    fn window_minutes_to_ms() {
        let limit = RateLimitSettings {
            max: 3,
            window_minutes: 1,
        };
        assert_eq!(limit.window_ms(), 60_000);
    }

    #[test]
    fn approval_requires_listed_types_only() {
        let approval = ApprovalSettings {
            enabled: true,
            action_types: vec!["post".into()],
        };
        assert!(approval.requires("post"));
        assert!(!approval.requires("like"));
    }

    #[test]
    fn approval_empty_list_means_all() {
        let approval = ApprovalSettings {
            enabled: true,
            action_types: vec![],
        };
        assert!(approval.requires("anything"));
    }

    #[test]
    fn approval_disabled_requires_nothing() {
        let approval = ApprovalSettings {
            enabled: false,
            action_types: vec!["post".into()],
        };
        assert!(!approval.requires("post"));
    }

    #[test]
    fn task_enabled_defaults_true() {
        let json = r#"{"name":"t","module":"m","action":"a","cron":"* * * * *"}"#;
        let task: TaskSettings = serde_json::from_str(json).unwrap();
        assert!(task.enabled);
        assert!(task.description.is_empty());
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(HelmSettings::default()).unwrap();
        assert!(json["server"].get("heartbeatIntervalSecs").is_some());
        assert!(json["browser"].get("maxReconnectAttempts").is_some());
        assert!(json.get("rateLimits").is_some());
    }
}
