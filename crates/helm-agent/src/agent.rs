//! Wires every component together and owns the process lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use helm_cdp::{ClientConfig, ProtocolClient};
use helm_core::{AgentEvent, BroadcastEventType, Clock, EventBus, SystemClock};
use helm_cron::{Scheduler, SchedulerDeps};
use helm_guard::{ApprovalGate, DryRun, RateLimiter, SafetyGate};
use helm_server::{EventBridge, HelmServer};
use helm_settings::{BrowserSettings, HelmSettings};
use helm_store::Stores;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::actions::ActionRouter;
use crate::browser::run_browser_bridge;

/// The assembled control plane.
pub struct Agent {
    settings: HelmSettings,
    bus: EventBus,
    browser: ProtocolClient,
    router: Arc<ActionRouter>,
    scheduler: Scheduler,
    server: HelmServer,
    cancel: CancellationToken,
    event_bridge: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    serve: Option<JoinHandle<()>>,
}

impl Agent {
    /// Open the configured store and assemble every component.
    pub fn build(settings: HelmSettings) -> Result<Self> {
        let stores = helm_store::open(&settings.database.path)
            .with_context(|| format!("failed to open store at {}", settings.database.path))?;
        Ok(Self::with_stores(settings, stores))
    }

    /// Assemble every component over existing stores.
    pub fn with_stores(settings: HelmSettings, stores: Stores) -> Self {
        let bus = EventBus::default();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let browser = ProtocolClient::new(client_config(&settings.browser));

        let limiter = RateLimiter::from_settings(stores.kv.clone(), clock.clone(), &settings.rate_limits);
        let approvals = ApprovalGate::new(
            stores.approvals.clone(),
            bus.clone(),
            settings.safety.approval.clone(),
        );
        let dry_run = DryRun::new(settings.safety.dry_run, stores.log.clone());
        let gate = SafetyGate::new(Arc::new(limiter), Arc::new(approvals), Arc::new(dry_run));
        let router = Arc::new(ActionRouter::new(gate).with_browser_actions(&browser));

        let scheduler = Scheduler::new(
            settings.tasks.clone(),
            SchedulerDeps {
                handler: router.clone(),
                store: stores.kv.clone(),
                log: stores.log.clone(),
                bus: bus.clone(),
                clock,
            },
        );
        let server = HelmServer::new(settings.server.clone());

        Self {
            settings,
            bus,
            browser,
            router,
            scheduler,
            server,
            cancel: CancellationToken::new(),
            event_bridge: None,
            background: Vec::new(),
            serve: None,
        }
    }

    /// Start bridges, the observer server, the browser connection, and the
    /// scheduler, then announce `agent:started`.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        self.event_bridge = Some(tokio::spawn(
            EventBridge::new(self.bus.subscribe(), self.server.hub().clone())
                .run_until(self.cancel.clone()),
        ));
        self.background.push(tokio::spawn(run_browser_bridge(
            self.browser.subscribe(),
            self.bus.clone(),
            self.cancel.clone(),
        )));
        self.background.push(tokio::spawn(run_approved_actions(
            self.bus.subscribe(),
            self.router.clone(),
            self.cancel.clone(),
        )));

        let (addr, serve) = self
            .server
            .listen()
            .await
            .context("failed to bind observer server")?;
        self.serve = Some(serve);

        if self.settings.browser.auto_connect {
            if let Err(e) = self.browser.connect().await {
                warn!(error = %e, "browser not reachable, actions will connect on demand");
            }
        }

        let tasks = self.scheduler.start().await;
        let dry_run = self.router.gate().dry_run().is_enabled();
        info!(%addr, tasks, dry_run, "agent started");
        self.bus.emit(
            BroadcastEventType::AgentStarted,
            json!({
                "address": addr.to_string(),
                "tasks": tasks,
                "dryRun": dry_run,
                "actions": self.router.actions(),
            }),
        );
        Ok(addr)
    }

    /// Announce shutdown, stop the scheduler and the browser, then close the
    /// hub once `agent:stopped` has been delivered.
    pub async fn shutdown(mut self) {
        info!("agent stopping");
        self.bus.emit(BroadcastEventType::AgentStopping, json!({}));
        self.scheduler.stop().await;
        self.browser.disconnect().await;
        self.bus.emit(BroadcastEventType::AgentStopped, json!({}));

        self.cancel.cancel();
        if let Some(bridge) = self.event_bridge.take() {
            let _ = bridge.await;
        }
        for task in self.background.drain(..) {
            let _ = task.await;
        }

        self.server.hub().close();
        self.server.shutdown();
        if let Some(serve) = self.serve.take() {
            let _ = serve.await;
        }
        info!("agent stopped");
    }
}

/// Map browser settings onto the protocol client's config.
pub fn client_config(settings: &BrowserSettings) -> ClientConfig {
    ClientConfig {
        host: settings.host.clone(),
        port: settings.port,
        max_reconnect_attempts: settings.max_reconnect_attempts,
        base_delay: Duration::from_millis(settings.base_delay_ms),
        max_delay: Duration::from_millis(settings.max_delay_ms),
        command_timeout: Duration::from_millis(settings.command_timeout_ms),
    }
}

/// Execute queued actions as their approvals come in.
async fn run_approved_actions(
    mut rx: broadcast::Receiver<AgentEvent>,
    router: Arc<ActionRouter>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            () = cancel.cancelled() => break,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(lagged = n, "approval runner lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if event.event_type != BroadcastEventType::ApprovalResolved
            || event.data["status"] != "approved"
        {
            continue;
        }
        let Some(approval_id) = event.data["approvalId"].as_str() else {
            continue;
        };
        match router.run_approved(approval_id).await {
            Ok(outcome) => info!(approval_id, outcome = outcome.label(), "approved action finished"),
            Err(e) => warn!(approval_id, error = %format!("{e:#}"), "approved action failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use helm_core::{ActionLog, ActionStatus, ApprovalQueue, ApprovalStatus};
    use helm_cron::TaskOutcome;
    use helm_guard::dry_run::DRY_RUN_MODULE;
    use helm_server::Outbound;
    use helm_settings::{ApprovalSettings, TaskSettings};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_settings() -> HelmSettings {
        let mut settings = HelmSettings::default();
        settings.server.port = 0;
        settings.database.path = helm_store::MEMORY_PATH.into();
        settings.browser.auto_connect = false;
        settings.browser.port = 1;
        settings.tasks = vec![TaskSettings {
            name: "reload".into(),
            module: "browser".into(),
            action: "reload".into(),
            cron: "0 9 * * *".into(),
            enabled: true,
            description: "reload the page".into(),
        }];
        settings
    }

    fn frame_type(frame: Outbound) -> Option<String> {
        match frame {
            Outbound::Text(text) => {
                let v: serde_json::Value = serde_json::from_str(text.as_str()).ok()?;
                v["type"].as_str().map(str::to_string)
            }
            Outbound::Ping => None,
        }
    }

    #[test]
    fn client_config_converts_units() {
        let config = client_config(&BrowserSettings {
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            command_timeout_ms: 1_500,
            ..BrowserSettings::default()
        });
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(4));
        assert_eq!(config.command_timeout, Duration::from_millis(1_500));
        assert_eq!(config.port, 9222);
    }

    #[tokio::test]
    async fn lifecycle_events_reach_observers() {
        let mut agent = Agent::build(test_settings()).unwrap();
        let hub = agent.server.hub().clone();
        let (conn, mut rx) = hub.register(None);
        assert_eq!(rx.recv().await.and_then(frame_type).as_deref(), Some("connected"));

        let addr = agent.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(agent.scheduler.is_registered("reload"));

        timeout(WAIT, async {
            while let Some(frame) = rx.recv().await {
                if frame_type(frame).as_deref() == Some("agent:started") {
                    break;
                }
            }
        })
        .await
        .unwrap();

        agent.shutdown().await;
        let mut rest = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            rest.extend(frame_type(frame));
        }
        let stopping = rest.iter().position(|t| t == "agent:stopping").unwrap();
        let stopped = rest.iter().position(|t| t == "agent:stopped").unwrap();
        assert!(stopping < stopped);
        assert_eq!(conn.close_code(), Some(1001));
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn dry_run_task_is_simulated() {
        let mut settings = test_settings();
        settings.safety.dry_run = true;
        let stores = Stores::memory();
        let agent = Agent::with_stores(settings, stores.clone());

        let outcome = agent.scheduler.run_now("reload").await.unwrap();
        assert_matches!(outcome, TaskOutcome::Completed { .. });

        let log = stores.log.recent(10).await.unwrap();
        assert!(log.iter().any(|e| e.module == DRY_RUN_MODULE
            && e.action == "browser/reload"
            && e.status == ActionStatus::Simulated));
        assert!(!agent.browser.is_connected());
    }

    #[tokio::test]
    async fn approved_task_runs_after_resolution() {
        let mut settings = test_settings();
        settings.safety.dry_run = true;
        settings.safety.approval = ApprovalSettings {
            enabled: true,
            action_types: vec!["browser/reload".into()],
        };
        let stores = Stores::memory();
        let mut agent = Agent::with_stores(settings, stores.clone());
        let _ = agent.start().await.unwrap();

        let _ = agent.scheduler.run_now("reload").await.unwrap();
        let pending = stores.approvals.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, "browser/reload");

        let resolved = agent
            .router
            .gate()
            .approvals()
            .resolve(&pending[0].id, true)
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);

        timeout(WAIT, async {
            loop {
                let log = stores.log.recent(20).await.unwrap();
                if log.iter().any(|e| e.status == ActionStatus::Simulated) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let spent = stores.approvals.get(&pending[0].id).await.unwrap().unwrap();
        assert_eq!(spent.status, ApprovalStatus::Executed);

        agent.shutdown().await;
    }
}
