//! Keeps the registry converged with the configuration store.
//!
//! Uses the store's change feed when it has one and falls back to polling
//! otherwise, or for good once the feed fails.

use futures::future::join_all;
use futures::StreamExt;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::monitor::{RunningMonitor, TaskContext};
use super::registry::Registry;
use crate::db::{ChangeEvent, ChangeOp, ChangeStream, ConfigStore, MonitorDefinition, StoreError};

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub poll_interval: Duration,
    pub force_polling: bool,
    /// Upper bound of the random start delay for newly discovered monitors.
    pub stagger_window: Duration,
}

/// Ids touched by one polling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub restarted: Vec<String>,
    pub stopped: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.restarted.is_empty() && self.stopped.is_empty()
    }
}

pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    registry: Registry,
    ctx: Arc<TaskContext>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        registry: Registry,
        ctx: Arc<TaskContext>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            store,
            registry,
            ctx,
            options,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn stagger(&self) -> Duration {
        let window = self.options.stagger_window.as_millis() as u64;
        if window == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..window))
    }

    fn spawn(&self, definition: MonitorDefinition, stagger: Duration) -> RunningMonitor {
        RunningMonitor::spawn(definition, self.ctx.clone(), stagger)
    }

    /// Start every monitor currently in the store, each after a random stagger.
    ///
    /// A store failure here is returned to the caller.
    pub async fn load_initial(&self) -> Result<usize, StoreError> {
        let definitions = self.store.fetch_all().await?;
        let report = self.reconcile_snapshot(definitions).await;
        tracing::info!("Loaded {} monitors", report.started.len());
        Ok(report.started.len())
    }

    /// Follow the change feed, or poll, until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        if self.options.force_polling {
            tracing::info!("Polling forced, checking for changes every {:?}", self.options.poll_interval);
        } else {
            match self.store.watch().await {
                Ok(stream) => {
                    tracing::info!("Watching configuration change feed");
                    if self.watch(stream, &shutdown).await {
                        return;
                    }
                    tracing::warn!(
                        "Falling back to polling every {:?}",
                        self.options.poll_interval
                    );
                }
                Err(e) => {
                    tracing::info!(
                        "Change feed unavailable ({}), polling every {:?}",
                        e,
                        self.options.poll_interval
                    );
                }
            }
        }

        self.poll(&shutdown).await;
    }

    /// Apply events until shutdown (returns true) or the stream fails (false).
    async fn watch(&self, mut stream: ChangeStream, shutdown: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return true,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply_event(event).await,
                    Some(Err(e)) => {
                        tracing::error!("Change feed error: {}", e);
                        return false;
                    }
                    None => {
                        tracing::warn!("Change feed closed");
                        return false;
                    }
                },
            }
        }
    }

    async fn poll(&self, shutdown: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once().await {
                Ok(report) if !report.is_empty() => tracing::info!(
                    "Reconciled: {} started, {} restarted, {} stopped",
                    report.started.len(),
                    report.restarted.len(),
                    report.stopped.len()
                ),
                Ok(_) => {}
                Err(e) => tracing::error!("Failed to fetch monitors: {}", e),
            }
        }
    }

    /// Fetch the full definition set and reconcile against it.
    pub async fn poll_once(&self) -> Result<ReconcileReport, StoreError> {
        let definitions = self.store.fetch_all().await?;
        Ok(self.reconcile_snapshot(definitions).await)
    }

    /// Two-pass diff: start new and restart changed monitors, then stop the
    /// ones missing from `definitions`.
    ///
    /// A monitor counts as changed only when its `updated_at` is strictly
    /// newer than the running copy's.
    ///
    /// The registry stays write-locked while old tasks stop, see [`Registry`].
    pub async fn reconcile_snapshot(&self, definitions: Vec<MonitorDefinition>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let incoming: HashSet<String> = definitions.iter().map(|d| d.id.clone()).collect();

        let mut registry = self.registry.write().await;

        for definition in definitions {
            let id = definition.id.clone();
            let running_since = registry.get(&id).map(|r| r.definition().updated_at);

            match running_since {
                None => {
                    let stagger = self.stagger();
                    registry.insert(id.clone(), self.spawn(definition, stagger));
                    report.started.push(id);
                }
                Some(updated_at) if definition.updated_at > updated_at => {
                    if let Some(old) = registry.remove(&id) {
                        old.stop().await;
                    }
                    tracing::info!("Monitor '{}' changed, restarting", definition.name);
                    registry.insert(id.clone(), self.spawn(definition, Duration::ZERO));
                    report.restarted.push(id);
                }
                Some(_) => {}
            }
        }

        let removed: Vec<String> = registry
            .keys()
            .filter(|id| !incoming.contains(*id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(old) = registry.remove(&id) {
                old.stop().await;
                report.stopped.push(id);
            }
        }

        report
    }

    /// Apply one change-feed event. Inserts and replaces start at once.
    pub async fn apply_event(&self, event: ChangeEvent) {
        match event.op {
            ChangeOp::Insert | ChangeOp::Replace => {
                let Some(definition) = self.resolve(&event).await else {
                    return;
                };

                let mut registry = self.registry.write().await;
                let replaced = match registry.remove(&definition.id) {
                    Some(old) => {
                        old.stop().await;
                        true
                    }
                    None => false,
                };
                tracing::info!(
                    "Monitor '{}' {}",
                    definition.name,
                    if replaced { "replaced" } else { "added" }
                );
                registry.insert(definition.id.clone(), self.spawn(definition, Duration::ZERO));
            }
            ChangeOp::Delete => {
                let mut registry = self.registry.write().await;
                match registry.remove(&event.id) {
                    Some(old) => old.stop().await,
                    None => tracing::warn!("Delete for unknown monitor {}, ignoring", event.id),
                }
            }
            ChangeOp::Other(op) => {
                tracing::warn!("Ignoring change event '{}' for monitor {}", op, event.id);
            }
        }
    }

    /// The event's definition, or the store's current one when the event
    /// carries only an id.
    async fn resolve(&self, event: &ChangeEvent) -> Option<MonitorDefinition> {
        if let Some(definition) = &event.definition {
            let mut definition = definition.clone();
            if definition.id.is_empty() {
                definition.id = event.id.clone();
            }
            return Some(definition);
        }

        match self.store.fetch_by_id(&event.id).await {
            Ok(definition) => Some(definition),
            Err(e) => {
                tracing::warn!("Cannot load monitor {} for change event: {}", event.id, e);
                None
            }
        }
    }

    /// Stop every running monitor concurrently and empty the registry.
    pub async fn shutdown(&self) {
        let mut registry = self.registry.write().await;
        let running: Vec<RunningMonitor> = registry.drain().map(|(_, r)| r).collect();
        let count = running.len();
        join_all(running.into_iter().map(RunningMonitor::stop)).await;
        tracing::info!("Stopped {} monitors", count);
    }
}
