//! Routes scheduled `(module, action)` pairs to registered handlers, each
//! run through the safety gate.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use helm_cdp::ProtocolClient;
use helm_cron::ActionHandler;
use helm_guard::{GateResult, SafetyGate};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

/// A registered action body.
pub type ActionFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Gate action type for a `(module, action)` pair, e.g. `browser/reload`.
pub fn action_type(module: &str, action: &str) -> String {
    format!("{module}/{action}")
}

/// Registry of action bodies keyed by `module/action`.
pub struct ActionRouter {
    gate: SafetyGate,
    actions: HashMap<String, ActionFn>,
}

impl ActionRouter {
    /// Empty router over `gate`.
    pub fn new(gate: SafetyGate) -> Self {
        Self {
            gate,
            actions: HashMap::new(),
        }
    }

    /// Register (or replace) the body for `module/action`.
    pub fn register<F, Fut>(&mut self, module: &str, action: &str, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let body: ActionFn = Arc::new(move || f().boxed());
        let _ = self.actions.insert(action_type(module, action), body);
    }

    /// Register `browser/version`, `browser/reload`, and `browser/screenshot`.
    pub fn with_browser_actions(mut self, client: &ProtocolClient) -> Self {
        let c = client.clone();
        self.register("browser", "version", move || {
            let client = c.clone();
            async move {
                ensure_connected(&client).await?;
                anyhow::Ok(client.send_command("Browser.getVersion", json!({})).await?)
            }
        });

        let c = client.clone();
        self.register("browser", "reload", move || {
            let client = c.clone();
            async move {
                ensure_connected(&client).await?;
                let _ = client
                    .send_command("Page.reload", json!({ "ignoreCache": false }))
                    .await?;
                anyhow::Ok(json!({ "reloaded": true }))
            }
        });

        let c = client.clone();
        self.register("browser", "screenshot", move || {
            let client = c.clone();
            async move {
                ensure_connected(&client).await?;
                let data = client.screenshot().await?;
                anyhow::Ok(json!({ "format": "png", "base64Length": data.len() }))
            }
        });
        self
    }

    /// Registered `module/action` keys, sorted.
    pub fn actions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.actions.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The gate every action runs through.
    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    /// Run `module/action` through the gate.
    ///
    /// Gate outcomes come back as values; only an unknown action, a store
    /// failure, or the action body's own error is an `Err`.
    pub async fn dispatch(&self, module: &str, action: &str) -> Result<GateResult<Value>> {
        let key = action_type(module, action);
        let body = self
            .actions
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow!("no handler registered for {key}"))?;
        let params = json!({ "module": module, "action": action });
        let result = self.gate.execute(&key, params, || body()).await?;
        settle(result).with_context(|| format!("{key} failed"))
    }

    /// Run an action whose approval request has been approved.
    pub async fn run_approved(&self, approval_id: &str) -> Result<GateResult<Value>> {
        let result = self
            .gate
            .execute_approved(approval_id, |data| self.invoke(data))
            .await?;
        settle(result).with_context(|| format!("approved action {approval_id} failed"))
    }

    async fn invoke(&self, data: Value) -> Result<Value> {
        let module = data["module"].as_str().unwrap_or_default();
        let action = data["action"].as_str().unwrap_or_default();
        let key = action_type(module, action);
        let body = self
            .actions
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow!("no handler registered for {key}"))?;
        body().await
    }
}

#[async_trait]
impl ActionHandler for ActionRouter {
    async fn run_task(&self, module: &str, action: &str) -> Result<()> {
        match self.dispatch(module, action).await? {
            GateResult::Executed(output) => {
                debug!(module, action, %output, "action executed");
            }
            GateResult::Simulated(_) => {
                info!(module, action, "action simulated");
            }
            GateResult::RateLimited(status) => {
                warn!(
                    module,
                    action,
                    reset_in_ms = status.reset_in.as_millis() as u64,
                    "action rate limited"
                );
            }
            GateResult::PendingApproval { approval_id } => {
                info!(module, action, %approval_id, "action awaiting approval");
            }
        }
        Ok(())
    }
}

async fn ensure_connected(client: &ProtocolClient) -> Result<()> {
    if !client.is_connected() {
        client
            .connect()
            .await
            .context("browser debugging endpoint unreachable")?;
    }
    Ok(())
}

fn settle(result: GateResult<Result<Value>>) -> Result<GateResult<Value>> {
    Ok(match result {
        GateResult::Executed(output) => GateResult::Executed(output?),
        GateResult::Simulated(sim) => GateResult::Simulated(sim),
        GateResult::RateLimited(status) => GateResult::RateLimited(status),
        GateResult::PendingApproval { approval_id } => GateResult::PendingApproval { approval_id },
    })
}
