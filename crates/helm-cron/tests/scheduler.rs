//! Scheduler behaviour on virtual time.
//!
//! `TokioClock` derives wall time from tokio's paused clock, so cron fire
//! times and timer sleeps advance together.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use assert_matches::assert_matches;
use async_trait::async_trait;
use helm_core::{
    ActionLog, ActionStatus, AgentEvent, BroadcastEventType, Clock, EventBus, KeyValueStore,
};
use helm_cron::{ActionHandler, Scheduler, SchedulerDeps, TaskOutcome};
use helm_settings::TaskSettings;
use helm_store::MemoryStore;
use tokio::sync::{Notify, broadcast};

/// 2024-03-04T10:00:30Z
const BASE_MS: i64 = 1_709_546_430_000;

struct TokioClock {
    start: tokio::time::Instant,
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        BASE_MS + self.start.elapsed().as_millis() as i64
    }
}

#[derive(Default)]
struct Recorder {
    calls: AtomicUsize,
    fail: bool,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl ActionHandler for Recorder {
    async fn run_task(&self, module: &str, action: &str) -> anyhow::Result<()> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            bail!("{module}/{action} exploded");
        }
        Ok(())
    }
}

fn task(name: &str, cron: &str, enabled: bool) -> TaskSettings {
    TaskSettings {
        name: name.into(),
        module: "browser".into(),
        action: "reload".into(),
        cron: cron.into(),
        enabled,
        description: format!("{name} task"),
    }
}

struct Harness {
    scheduler: Scheduler,
    handler: Arc<Recorder>,
    store: Arc<MemoryStore>,
    events: broadcast::Receiver<AgentEvent>,
}

fn harness(tasks: Vec<TaskSettings>, handler: Recorder) -> Harness {
    harness_with_store(tasks, handler, Arc::new(MemoryStore::new()))
}

fn harness_with_store(tasks: Vec<TaskSettings>, handler: Recorder, store: Arc<MemoryStore>) -> Harness {
    let handler = Arc::new(handler);
    let bus = EventBus::default();
    let events = bus.subscribe();
    let scheduler = Scheduler::new(
        tasks,
        SchedulerDeps {
            handler: handler.clone(),
            store: store.clone(),
            log: store.clone(),
            bus,
            clock: Arc::new(TokioClock {
                start: tokio::time::Instant::now(),
            }),
        },
    );
    Harness {
        scheduler,
        handler,
        store,
        events,
    }
}

fn drain(events: &mut broadcast::Receiver<AgentEvent>) -> Vec<BroadcastEventType> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn fires_on_cadence_and_resumes_after_enable() {
    let mut h = harness(vec![task("reload", "* * * * *", true)], Recorder::default());
    assert_eq!(h.scheduler.start().await, 1);

    // First minute boundary is 30 s away.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(h.handler.calls.load(Ordering::SeqCst), 1);
    assert!(drain(&mut h.events).contains(&BroadcastEventType::TaskComplete));

    h.scheduler.disable("reload").unwrap();
    assert!(!h.scheduler.is_registered("reload"));
    tokio::time::sleep(Duration::from_secs(180)).await;
    assert_eq!(h.handler.calls.load(Ordering::SeqCst), 1);

    h.scheduler.enable("reload").unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.handler.calls.load(Ordering::SeqCst), 2);

    let seen = drain(&mut h.events);
    assert!(seen.contains(&BroadcastEventType::ModuleDisabled));
    assert!(seen.contains(&BroadcastEventType::ModuleEnabled));
    h.scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn run_now_works_while_disabled() {
    let h = harness(vec![task("digest", "0 9 * * *", false)], Recorder::default());
    let _ = h.scheduler.start().await;

    let outcome = h.scheduler.run_now("digest").await.unwrap();
    assert_matches!(outcome, TaskOutcome::Completed { .. });
    assert!(!h.scheduler.is_registered("digest"));

    let status = &h.scheduler.status()[0];
    assert!(!status.enabled);
    assert!(status.last_run.is_some());
    assert!(status.next_run.is_none());
    assert_eq!(status.description, "digest task");

    let log = h.store.recent(10).await.unwrap();
    assert_eq!(log[0].status, ActionStatus::Success);
    assert_eq!(log[0].module, "browser");
}

#[tokio::test(start_paused = true)]
async fn overlapping_run_is_skipped() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        vec![task("slow", "0 9 * * *", true)],
        Recorder {
            gate: Some(gate.clone()),
            ..Recorder::default()
        },
    );

    let first = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.run_now("slow").await })
    };
    while h.handler.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    assert!(h.scheduler.status()[0].running);

    assert_eq!(h.scheduler.run_now("slow").await.unwrap(), TaskOutcome::Skipped);
    assert_eq!(h.handler.calls.load(Ordering::SeqCst), 1);

    gate.notify_one();
    assert_matches!(first.await.unwrap().unwrap(), TaskOutcome::Completed { .. });
    assert!(!h.scheduler.status()[0].running);

    let statuses: Vec<_> = h
        .store
        .recent(10)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.status)
        .collect();
    assert_eq!(statuses, [ActionStatus::Success, ActionStatus::Skipped]);
}

#[tokio::test(start_paused = true)]
async fn failure_is_logged_and_emitted() {
    let mut h = harness(
        vec![task("broken", "0 9 * * *", true)],
        Recorder {
            fail: true,
            ..Recorder::default()
        },
    );

    let outcome = h.scheduler.run_now("broken").await.unwrap();
    assert_matches!(outcome, TaskOutcome::Failed { ref error, .. } if error.contains("exploded"));

    let entry = &h.store.recent(1).await.unwrap()[0];
    assert_eq!(entry.status, ActionStatus::Error);
    assert!(entry.duration_ms.is_some());
    assert!(entry.error.as_deref().unwrap().contains("browser/reload"));

    let event = h.events.recv().await.unwrap();
    assert_eq!(event.event_type, BroadcastEventType::TaskError);
    assert_eq!(event.data["task"], "broken");
    assert!(h.scheduler.status()[0].last_run.is_none());

    // The scheduler keeps going after a failure.
    assert_matches!(
        h.scheduler.run_now("broken").await.unwrap(),
        TaskOutcome::Failed { .. }
    );
}

#[tokio::test(start_paused = true)]
async fn run_times_survive_restart() {
    let store = Arc::new(MemoryStore::new());
    let first = harness_with_store(
        vec![task("daily", "0 9 * * *", true)],
        Recorder::default(),
        store.clone(),
    );
    let _ = first.scheduler.start().await;
    let _ = first.scheduler.run_now("daily").await.unwrap();
    let last_run = first.scheduler.status()[0].last_run.clone();
    first.scheduler.stop().await;

    let persisted = store.get("schedule:daily").await.unwrap().unwrap();
    assert_eq!(persisted["lastRun"].as_str(), last_run.as_deref());
    assert_eq!(persisted["nextRun"], "2024-03-05T09:00:00.000Z");

    let second = harness_with_store(vec![task("daily", "0 9 * * *", false)], Recorder::default(), store);
    let _ = second.scheduler.start().await;
    assert_eq!(second.scheduler.status()[0].last_run, last_run);
}
