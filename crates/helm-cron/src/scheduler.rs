//! Task scheduler.
//!
//! Each enabled task gets one job: a loop that sleeps until the next cron
//! fire time and then spawns an execution. Executions go through a per-task
//! lock, so a run that arrives while the previous one is still in flight is
//! skipped and recorded as such. Run times are persisted under
//! `schedule:<name>` and reloaded on [`Scheduler::start`].

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use cron::Schedule;
use helm_core::{
    ActionLog, ActionLogEntry, ActionStatus, BroadcastEventType, Clock, EventBus, KeyValueStore,
};
use helm_settings::TaskSettings;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::SchedulerError;
use crate::handler::ActionHandler;
use crate::schedule::{next_after, parse_cron};

/// Store key prefix for persisted run times.
pub const KEY_PREFIX: &str = "schedule:";

/// Snapshot of one task, as returned by [`Scheduler::status`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// Task name.
    pub name: String,
    /// Handling module.
    pub module: String,
    /// Action within the module.
    pub action: String,
    /// Cron expression as configured.
    pub cron: String,
    /// Human-readable description.
    pub description: String,
    /// Whether the task is enabled.
    pub enabled: bool,
    /// Whether an execution is in flight.
    pub running: bool,
    /// ISO-8601 time of the last successful run.
    pub last_run: Option<String>,
    /// ISO-8601 time of the next scheduled run.
    pub next_run: Option<String>,
}

/// Result of one execution attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The handler succeeded.
    Completed {
        /// Wall time spent.
        duration_ms: u64,
    },
    /// The handler returned an error.
    Failed {
        /// Error message.
        error: String,
        /// Wall time spent.
        duration_ms: u64,
    },
    /// A previous run was still in flight; nothing ran.
    Skipped,
}

struct Job {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct TaskEntry {
    def: TaskSettings,
    schedule: Option<Schedule>,
    enabled: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    job: Option<Job>,
}

struct Inner {
    tasks: Mutex<Vec<TaskEntry>>,
    running: Mutex<HashSet<String>>,
    handler: Arc<dyn ActionHandler>,
    store: Arc<dyn KeyValueStore>,
    log: Arc<dyn ActionLog>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

/// Collaborators the scheduler needs.
pub struct SchedulerDeps {
    /// Runs the `(module, action)` pairs.
    pub handler: Arc<dyn ActionHandler>,
    /// Run-time persistence.
    pub store: Arc<dyn KeyValueStore>,
    /// Action log.
    pub log: Arc<dyn ActionLog>,
    /// Event bus for `task:*` and `module:*` events.
    pub bus: EventBus,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Cron scheduler over a fixed list of task definitions.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Releases a task's execution lock when the run ends, however it ends.
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let _ = self.running.lock().remove(&self.name);
    }
}

fn iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_iso(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

impl Scheduler {
    /// Scheduler for `tasks`. Nothing runs until [`start`](Self::start).
    pub fn new(tasks: Vec<TaskSettings>, deps: SchedulerDeps) -> Self {
        let entries = tasks
            .into_iter()
            .map(|def| TaskEntry {
                schedule: None,
                enabled: def.enabled,
                last_run: None,
                next_run: None,
                job: None,
                def,
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(entries),
                running: Mutex::new(HashSet::new()),
                handler: deps.handler,
                store: deps.store,
                log: deps.log,
                bus: deps.bus,
                clock: deps.clock,
            }),
        }
    }

    /// Load persisted run times and register a job for every enabled task
    /// with a valid cron expression. Returns how many jobs were registered.
    pub async fn start(&self) -> usize {
        self.inner.load_run_times().await;

        let names: Vec<String> = self
            .inner
            .tasks
            .lock()
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.def.name.clone())
            .collect();

        let mut registered = 0;
        for name in names {
            match Inner::register(&self.inner, &name) {
                Ok(()) => registered += 1,
                Err(err) => warn!(task = %name, error = %err, "task not scheduled"),
            }
        }
        info!(registered, "scheduler started");
        registered
    }

    /// Run a task now, regardless of its enabled state or schedule.
    pub async fn run_now(&self, name: &str) -> Result<TaskOutcome, SchedulerError> {
        self.inner.execute(name).await
    }

    /// Enable a task and start its job.
    pub fn enable(&self, name: &str) -> Result<(), SchedulerError> {
        Inner::register(&self.inner, name)?;
        let module = {
            let mut tasks = self.inner.tasks.lock();
            let entry = find_mut(&mut tasks, name)?;
            entry.enabled = true;
            entry.def.module.clone()
        };
        info!(task = name, "task enabled");
        self.inner.bus.emit(
            BroadcastEventType::ModuleEnabled,
            json!({ "task": name, "module": module }),
        );
        Ok(())
    }

    /// Disable a task and stop its job. Configuration and history are kept.
    pub fn disable(&self, name: &str) -> Result<(), SchedulerError> {
        let module = {
            let mut tasks = self.inner.tasks.lock();
            let entry = find_mut(&mut tasks, name)?;
            entry.enabled = false;
            entry.next_run = None;
            if let Some(job) = entry.job.take() {
                job.cancel.cancel();
            }
            entry.def.module.clone()
        };
        info!(task = name, "task disabled");
        self.inner.bus.emit(
            BroadcastEventType::ModuleDisabled,
            json!({ "task": name, "module": module }),
        );
        Ok(())
    }

    /// Whether a job is currently registered for `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.inner
            .tasks
            .lock()
            .iter()
            .any(|t| t.def.name == name && t.job.is_some())
    }

    /// Every configured task, in configuration order.
    pub fn status(&self) -> Vec<TaskStatus> {
        let running = self.inner.running.lock().clone();
        self.inner
            .tasks
            .lock()
            .iter()
            .map(|t| TaskStatus {
                name: t.def.name.clone(),
                module: t.def.module.clone(),
                action: t.def.action.clone(),
                cron: t.def.cron.clone(),
                description: t.def.description.clone(),
                enabled: t.enabled,
                running: running.contains(&t.def.name),
                last_run: t.last_run.map(iso),
                next_run: t.next_run.map(iso),
            })
            .collect()
    }

    /// Cancel every job. In-flight executions finish on their own.
    pub async fn stop(&self) {
        let jobs: Vec<Job> = self
            .inner
            .tasks
            .lock()
            .iter_mut()
            .filter_map(|t| t.job.take())
            .collect();
        let count = jobs.len();
        for job in &jobs {
            job.cancel.cancel();
        }
        for job in jobs {
            let _ = job.handle.await;
        }
        info!(jobs = count, "scheduler stopped");
    }
}

fn find_mut<'a>(tasks: &'a mut [TaskEntry], name: &str) -> Result<&'a mut TaskEntry, SchedulerError> {
    tasks
        .iter_mut()
        .find(|t| t.def.name == name)
        .ok_or_else(|| SchedulerError::UnknownTask {
            name: name.to_string(),
        })
}

impl Inner {
    async fn load_run_times(&self) {
        let names: Vec<String> = self.tasks.lock().iter().map(|t| t.def.name.clone()).collect();
        for name in names {
            let stored = match self.store.get(&format!("{KEY_PREFIX}{name}")).await {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(err) => {
                    warn!(task = %name, error = %err, "failed to load run times");
                    continue;
                }
            };
            let mut tasks = self.tasks.lock();
            if let Some(entry) = tasks.iter_mut().find(|t| t.def.name == name) {
                entry.last_run = parse_iso(&stored["lastRun"]);
                entry.next_run = parse_iso(&stored["nextRun"]);
            }
        }
    }

    /// Start the job for `name` unless one is already running.
    fn register(inner: &Arc<Self>, name: &str) -> Result<(), SchedulerError> {
        let mut tasks = inner.tasks.lock();
        let entry = find_mut(&mut tasks, name)?;
        if entry.job.is_some() {
            return Ok(());
        }
        let schedule = match &entry.schedule {
            Some(s) => s.clone(),
            None => {
                let parsed = parse_cron(&entry.def.cron)?;
                entry.schedule = Some(parsed.clone());
                parsed
            }
        };
        entry.next_run = next_after(&schedule, &inner.clock.now());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(job_loop(
            Arc::downgrade(inner),
            name.to_string(),
            schedule,
            cancel.clone(),
        ));
        entry.job = Some(Job { cancel, handle });
        debug!(task = name, cron = %entry.def.cron, "job registered");
        Ok(())
    }

    #[instrument(skip_all, fields(task = name))]
    async fn execute(&self, name: &str) -> Result<TaskOutcome, SchedulerError> {
        let def = self
            .tasks
            .lock()
            .iter()
            .find(|t| t.def.name == name)
            .map(|t| t.def.clone())
            .ok_or_else(|| SchedulerError::UnknownTask {
                name: name.to_string(),
            })?;

        if !self.running.lock().insert(name.to_string()) {
            info!("previous run still in flight, skipping");
            counter!("scheduler_task_runs_total", "outcome" => "skipped").increment(1);
            self.record(ActionLogEntry::new(&def.module, &def.action, ActionStatus::Skipped)
                .with_details(json!({ "task": name })))
                .await;
            return Ok(TaskOutcome::Skipped);
        }
        let _guard = RunningGuard {
            running: &self.running,
            name: name.to_string(),
        };

        let started = Instant::now();
        let result = self.handler.run_task(&def.module, &def.action).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                self.mark_completed(name).await;
                info!(duration_ms, "task completed");
                counter!("scheduler_task_runs_total", "outcome" => "success").increment(1);
                self.record(
                    ActionLogEntry::new(&def.module, &def.action, ActionStatus::Success)
                        .with_duration_ms(duration_ms)
                        .with_details(json!({ "task": name })),
                )
                .await;
                self.bus.emit(
                    BroadcastEventType::TaskComplete,
                    json!({
                        "task": name,
                        "module": def.module,
                        "action": def.action,
                        "durationMs": duration_ms,
                    }),
                );
                Ok(TaskOutcome::Completed { duration_ms })
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(duration_ms, error = %error, "task failed");
                counter!("scheduler_task_runs_total", "outcome" => "error").increment(1);
                self.record(
                    ActionLogEntry::new(&def.module, &def.action, ActionStatus::Error)
                        .with_duration_ms(duration_ms)
                        .with_error(error.clone())
                        .with_details(json!({ "task": name })),
                )
                .await;
                self.bus.emit(
                    BroadcastEventType::TaskError,
                    json!({
                        "task": name,
                        "module": def.module,
                        "action": def.action,
                        "error": error,
                        "durationMs": duration_ms,
                    }),
                );
                Ok(TaskOutcome::Failed { error, duration_ms })
            }
        }
    }

    async fn mark_completed(&self, name: &str) {
        let now = self.clock.now();
        let persisted = {
            let mut tasks = self.tasks.lock();
            let Some(entry) = tasks.iter_mut().find(|t| t.def.name == name) else {
                return;
            };
            entry.last_run = Some(now);
            let schedule = match &entry.schedule {
                Some(s) => Some(s.clone()),
                None => parse_cron(&entry.def.cron).ok(),
            };
            if entry.enabled {
                entry.next_run = schedule.as_ref().and_then(|s| next_after(s, &now));
            }
            json!({
                "lastRun": iso(now),
                "nextRun": entry.next_run.map(iso),
            })
        };
        if let Err(err) = self.store.set(&format!("{KEY_PREFIX}{name}"), persisted).await {
            warn!(task = name, error = %err, "failed to persist run times");
        }
    }

    async fn record(&self, entry: ActionLogEntry) {
        if let Err(err) = self.log.record(entry).await {
            warn!(error = %err, "failed to write action log");
        }
    }

    fn set_next_run(&self, name: &str, next: DateTime<Utc>) {
        if let Some(entry) = self.tasks.lock().iter_mut().find(|t| t.def.name == name) {
            entry.next_run = Some(next);
        }
    }
}

/// Next fire time after both `now` and the previous fire. The sleep is
/// monotonic but `now` is wall time, which can step backwards past a tick
/// that already fired.
fn next_fire(
    schedule: &Schedule,
    now: DateTime<Utc>,
    last_fire: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let from = last_fire.map_or(now, |last| last.max(now));
    next_after(schedule, &from)
}

async fn job_loop(inner: Weak<Inner>, name: String, schedule: Schedule, cancel: CancellationToken) {
    let mut last_fire = None;
    loop {
        let (now, next) = {
            let Some(inner) = inner.upgrade() else { return };
            let now = inner.clock.now();
            let Some(next) = next_fire(&schedule, now, last_fire) else {
                info!(task = %name, "schedule has no further fire times");
                return;
            };
            inner.set_next_run(&name, next);
            (now, next)
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            () = cancel.cancelled() => {
                debug!(task = %name, "job cancelled");
                return;
            }
            () = tokio::time::sleep(wait) => {}
        }
        last_fire = Some(next);

        let Some(inner) = inner.upgrade() else { return };
        let task = name.clone();
        let _ = tokio::spawn(async move {
            if let Err(err) = inner.execute(&task).await {
                warn!(task = %task, error = %err, "scheduled run failed to start");
            }
        });
    }
}
