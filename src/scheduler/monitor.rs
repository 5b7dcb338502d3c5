//! One periodic task per monitor: stagger, tick, probe, classify, record, alert.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::alert::{AlertState, AlertTracker};
use super::classify::classify;
use crate::config::DebugProtocols;
use crate::db::{MonitorDefinition, MonitorType, ProbeResult, ResultSink};
use crate::probe::run_probe;
use crate::web::MetricsRegistry;

/// Executes a single probe attempt.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, kind: MonitorType, monitor: &MonitorDefinition) -> ProbeResult;
}

/// The real network probes.
pub struct NetworkProber;

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, kind: MonitorType, monitor: &MonitorDefinition) -> ProbeResult {
        run_probe(kind, monitor).await
    }
}

/// Collaborators shared by every monitor task.
pub struct TaskContext {
    pub prober: Arc<dyn Prober>,
    pub sink: Arc<dyn ResultSink>,
    pub tracker: Arc<AlertTracker>,
    pub metrics: Option<Arc<MetricsRegistry>>,
    pub debug: DebugProtocols,
}

/// Lifecycle of a monitor task. `Idle` and `Stopped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Idle,
    Scheduled,
    Running,
    Stopped,
}

impl TaskState {
    fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Idle | TaskState::Stopped)
    }
}

pub struct MonitorTask {
    definition: MonitorDefinition,
    ctx: Arc<TaskContext>,
    alert: Mutex<AlertState>,
    state: Mutex<TaskState>,
    cancel: CancellationToken,
}

impl MonitorTask {
    pub fn new(definition: MonitorDefinition, ctx: Arc<TaskContext>) -> Self {
        Self {
            definition,
            ctx,
            alert: Mutex::new(AlertState::default()),
            state: Mutex::new(TaskState::Created),
            cancel: CancellationToken::new(),
        }
    }

    pub fn definition(&self) -> &MonitorDefinition {
        &self.definition
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn alert_state(&self) -> AlertState {
        *self.alert.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next` unless already in a terminal state.
    fn transition(&self, next: TaskState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.is_terminal() {
            *state = next;
        }
    }

    /// Run the monitor until stopped.
    ///
    /// Returns immediately, leaving the task `Idle`, when the interval is
    /// invalid or the monitor is disabled. Otherwise waits `stagger`, runs
    /// once, then once per interval. A tick already in progress when `stop`
    /// is called runs to completion.
    pub async fn start(&self, stagger: Duration) {
        let m = &self.definition;

        let interval = match m.interval_duration() {
            Ok(interval) => interval,
            Err(e) => {
                tracing::warn!("Monitor '{}' not scheduled: {}", m.name, e);
                self.transition(TaskState::Idle);
                return;
            }
        };

        if !m.enabled {
            tracing::info!("Monitor '{}' is disabled, not scheduling", m.name);
            self.transition(TaskState::Idle);
            return;
        }

        self.transition(TaskState::Scheduled);
        tracing::info!(
            "Starting monitor '{}' ({}) every {:?} after {:?}",
            m.name,
            m.monitor_type,
            interval,
            stagger
        );

        if !stagger.is_zero() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.transition(TaskState::Stopped);
                    return;
                }
                _ = tokio::time::sleep(stagger) => {}
            }
        }

        self.transition(TaskState::Running);

        // First tick completes immediately
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_once().await;
        }

        self.transition(TaskState::Stopped);
        tracing::debug!("Monitor '{}' loop exited", m.name);
    }

    /// Cancel the task. Safe to call repeatedly and before `start`.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.transition(TaskState::Stopped);
    }

    /// Execute one check: probe, classify, export, store, alert.
    ///
    /// Returns `(false, None)` without probing when the monitor is disabled,
    /// has no target, or has an unknown type.
    pub async fn run_once(&self) -> (bool, Option<ProbeResult>) {
        let m = &self.definition;

        if !m.enabled {
            return (false, None);
        }
        if m.target.trim().is_empty() {
            tracing::warn!("Monitor '{}' has no target, skipping run", m.name);
            return (false, None);
        }
        let Some(kind) = m.kind() else {
            tracing::warn!("Monitor '{}' has unknown type '{}', skipping run", m.name, m.monitor_type);
            return (false, None);
        };

        let mut result = self.ctx.prober.probe(kind, m).await;
        classify(&mut result, &m.rule);

        if self.ctx.debug.enabled_for(kind) {
            tracing::info!(
                "Monitor '{}' outputs: {}",
                m.name,
                serde_json::to_string(&result.outputs).unwrap_or_default()
            );
        }
        tracing::debug!(
            "Monitor '{}' ran: status={} value={} message='{}'",
            m.name,
            result.status,
            result.value,
            result.message
        );

        if let Some(metrics) = &self.ctx.metrics {
            metrics.update(m, &result);
        }

        if let Err(e) = self.ctx.sink.store_result(&result).await {
            tracing::error!("Failed to store result for '{}': {}", m.name, e);
        }

        // Counters are written only by this task.
        let mut alert = self.alert_state();
        self.ctx.tracker.observe(m, &result, &mut alert).await;
        *self.alert.lock().unwrap_or_else(|e| e.into_inner()) = alert;

        (result.is_ok(), Some(result))
    }
}

/// A spawned monitor task and its join handle.
pub struct RunningMonitor {
    task: Arc<MonitorTask>,
    join: JoinHandle<()>,
}

impl RunningMonitor {
    /// Spawn `definition` as its own task, first running after `stagger`.
    pub fn spawn(definition: MonitorDefinition, ctx: Arc<TaskContext>, stagger: Duration) -> Self {
        let task = Arc::new(MonitorTask::new(definition, ctx));
        let runner = task.clone();
        let join = tokio::spawn(async move { runner.start(stagger).await });
        Self { task, join }
    }

    pub fn task(&self) -> &Arc<MonitorTask> {
        &self.task
    }

    pub fn definition(&self) -> &MonitorDefinition {
        self.task.definition()
    }

    /// Stop the task and wait until its loop has exited.
    pub async fn stop(self) {
        self.task.stop();
        if let Err(e) = self.join.await {
            tracing::error!("Monitor '{}' task ended abnormally: {}", self.task.definition.name, e);
        }
        if let Some(metrics) = &self.task.ctx.metrics {
            metrics.remove(&self.task.definition.id);
        }
        tracing::info!("Stopped monitor '{}'", self.task.definition.name);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake prober and context shared by scheduler tests.

    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::Status;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every probe with a canned status after `latency`, and
    /// records how many probes ran per monitor id and their peak overlap.
    #[derive(Default)]
    pub struct FakeProber {
        pub latency: Duration,
        pub status: Mutex<HashMap<String, Status>>,
        calls: Mutex<HashMap<String, usize>>,
        active: Mutex<HashMap<String, usize>>,
        pub max_overlap: AtomicUsize,
    }

    impl FakeProber {
        pub fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Default::default()
            }
        }

        pub fn set_status(&self, id: &str, status: Status) {
            self.status.lock().unwrap().insert(id.to_string(), status);
        }

        pub fn calls(&self, id: &str) -> usize {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }

        pub fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, _kind: MonitorType, monitor: &MonitorDefinition) -> ProbeResult {
            {
                *self.calls.lock().unwrap().entry(monitor.id.clone()).or_default() += 1;
                let mut active = self.active.lock().unwrap();
                let n = active.entry(monitor.id.clone()).or_default();
                *n += 1;
                self.max_overlap.fetch_max(*n, Ordering::SeqCst);
            }

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            *self.active.lock().unwrap().get_mut(&monitor.id).unwrap() -= 1;

            let mut result = ProbeResult::new(monitor);
            result.status = self
                .status
                .lock()
                .unwrap()
                .get(&monitor.id)
                .copied()
                .unwrap_or(Status::Ok);
            if result.status != Status::Ok {
                result.message = "fake failure".to_string();
            }
            result.value = 7;
            result.outputs.insert("status".to_string(), 200i64.into());
            result
        }
    }

    pub fn context(prober: Arc<FakeProber>, sink: Arc<MemoryStore>) -> Arc<TaskContext> {
        Arc::new(TaskContext {
            prober,
            sink,
            tracker: Arc::new(AlertTracker::new(3, "http://localhost:3000", None)),
            metrics: Some(Arc::new(MetricsRegistry::new())),
            debug: DebugProtocols::default(),
        })
    }

    pub fn definition(id: &str) -> MonitorDefinition {
        MonitorDefinition {
            id: id.to_string(),
            name: format!("monitor {}", id),
            monitor_type: "http".to_string(),
            target: format!("http://{}.example", id),
            interval: "10s".to_string(),
            enabled: true,
            ..Default::default()
        }
    }
}
