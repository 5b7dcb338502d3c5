//! The live set of running monitors, keyed by monitor id.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};

use super::alert::AlertState;
use super::monitor::{RunningMonitor, TaskState};

/// What readers see of one registry entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub monitor_type: String,
    pub target: String,
    pub interval: String,
    pub enabled: bool,
    pub state: TaskState,
    #[serde(flatten)]
    pub alert: AlertState,
}

/// Registry guarded by one async lock.
///
/// Only the reconciler takes the write lock, and it holds it across a whole
/// stop-then-start sequence, so readers never observe a half-replaced entry
/// and a replacement never probes while its predecessor is still running.
/// Stopping waits for the old task's in-flight run, which includes a probe
/// timeout, a ping burst or a webhook send, so `snapshot` and `len` can
/// block for that long during a restart.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, RunningMonitor>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) async fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RunningMonitor>> {
        self.inner.write().await
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Consistent view of every entry, sorted by id.
    pub async fn snapshot(&self) -> Vec<MonitorStatus> {
        let guard = self.inner.read().await;
        let mut out: Vec<MonitorStatus> = guard
            .values()
            .map(|running| {
                let task = running.task();
                let m = task.definition();
                MonitorStatus {
                    id: m.id.clone(),
                    name: m.name.clone(),
                    monitor_type: m.monitor_type.clone(),
                    target: m.target.clone(),
                    interval: m.interval.clone(),
                    enabled: m.enabled,
                    state: task.state(),
                    alert: task.alert_state(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
