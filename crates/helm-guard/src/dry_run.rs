//! Dry-run wrapper: log what an action would have done instead of doing it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use helm_core::events::iso_now;
use helm_core::{ActionLog, ActionLogEntry, ActionStatus};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

/// Module name used for simulated entries in the action log.
pub const DRY_RUN_MODULE: &str = "dry_run";

/// Record of an action that was simulated rather than executed.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedAction {
    /// Action that would have run.
    pub action_name: String,
    /// ISO-8601 time of the simulation.
    pub timestamp: String,
    /// Parameters it would have run with.
    pub params: Value,
}

/// Result of [`DryRun::wrap`].
#[derive(Debug)]
pub enum GateOutcome<T> {
    /// The wrapped future ran; here is its output.
    Executed(T),
    /// Dry-run is on; the wrapped future was never polled.
    Simulated(SimulatedAction),
}

/// Runtime-toggleable dry-run switch.
pub struct DryRun {
    enabled: AtomicBool,
    log: Arc<dyn ActionLog>,
}

impl DryRun {
    /// Create with an initial state.
    pub fn new(enabled: bool, log: Arc<dyn ActionLog>) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            log,
        }
    }

    /// Whether actions are currently simulated.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turn simulation on or off.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::Relaxed);
        if was != enabled {
            info!(enabled, "dry-run toggled");
        }
    }

    /// Run `f`, or simulate it when dry-run is on.
    pub async fn wrap<T, F, Fut>(&self, action_name: &str, params: Value, f: F) -> GateOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.is_enabled() {
            return GateOutcome::Executed(f().await);
        }

        let simulated = SimulatedAction {
            action_name: action_name.to_string(),
            timestamp: iso_now(),
            params,
        };
        info!(
            action = %simulated.action_name,
            params = %simulated.params,
            "[dry-run] action simulated"
        );
        let entry = ActionLogEntry::new(DRY_RUN_MODULE, action_name, ActionStatus::Simulated)
            .with_details(simulated.params.clone());
        if let Err(err) = self.log.record(entry).await {
            warn!(action = action_name, error = %err, "failed to log simulated action");
        }
        GateOutcome::Simulated(simulated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use helm_store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn disabled_runs_exactly_once() {
        let dry = DryRun::new(false, Arc::new(MemoryStore::new()));
        let calls = AtomicUsize::new(0);
        let out = dry
            .wrap("post", json!({}), || async {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                42
            })
            .await;
        assert_matches!(out, GateOutcome::Executed(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enabled_never_calls_and_logs() {
        let store = Arc::new(MemoryStore::new());
        let dry = DryRun::new(true, store.clone());
        let calls = AtomicUsize::new(0);
        let out = dry
            .wrap("post", json!({"text": "hello"}), || async {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let GateOutcome::Simulated(sim) = out else {
            panic!("expected simulation");
        };
        assert_eq!(sim.action_name, "post");
        assert_eq!(sim.params, json!({"text": "hello"}));

        let logged = store.recent(1).await.unwrap();
        assert_eq!(logged[0].status, ActionStatus::Simulated);
        assert_eq!(logged[0].module, DRY_RUN_MODULE);
        assert_eq!(logged[0].details, Some(json!({"text": "hello"})));
    }

    #[tokio::test]
    async fn toggle_at_runtime() {
        let dry = DryRun::new(true, Arc::new(MemoryStore::new()));
        dry.set_enabled(false);
        assert!(!dry.is_enabled());
        assert_matches!(
            dry.wrap("x", Value::Null, || async { "ran" }).await,
            GateOutcome::Executed("ran")
        );
    }
}
