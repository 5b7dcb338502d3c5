//! In-memory configuration store with a change feed, used to drive the
//! reconciler in tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::models::{MonitorDefinition, ProbeResult};
use super::traits::{ChangeEvent, ChangeStream, ConfigStore, ResultSink, StoreError};

pub struct MemoryStore {
    monitors: RwLock<BTreeMap<String, MonitorDefinition>>,
    results: Mutex<Vec<ProbeResult>>,
    changes: broadcast::Sender<ChangeEvent>,
    push: bool,
}

impl MemoryStore {
    /// A store with a live change feed.
    pub fn new() -> Self {
        Self::with_push(true)
    }

    /// A store whose `watch` reports push as unsupported.
    pub fn polling_only() -> Self {
        Self::with_push(false)
    }

    fn with_push(push: bool) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            monitors: RwLock::new(BTreeMap::new()),
            results: Mutex::new(Vec::new()),
            changes,
            push,
        }
    }

    /// Insert or replace a monitor and publish the matching change event.
    pub fn upsert(&self, monitor: MonitorDefinition) {
        let previous = self
            .monitors
            .write()
            .unwrap()
            .insert(monitor.id.clone(), monitor.clone());
        let event = match previous {
            Some(_) => ChangeEvent::replace(monitor),
            None => ChangeEvent::insert(monitor),
        };
        let _ = self.changes.send(event);
    }

    pub fn remove(&self, id: &str) {
        self.monitors.write().unwrap().remove(id);
        let _ = self.changes.send(ChangeEvent::delete(id));
    }

    /// Publish an arbitrary event without touching the stored set.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.changes.send(event);
    }

    pub fn results(&self) -> Vec<ProbeResult> {
        self.results.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn fetch_all(&self) -> Result<Vec<MonitorDefinition>, StoreError> {
        Ok(self.monitors.read().unwrap().values().cloned().collect())
    }

    async fn fetch_by_id(&self, id: &str) -> Result<MonitorDefinition, StoreError> {
        self.monitors
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn watch(&self) -> Result<ChangeStream, StoreError> {
        if !self.push {
            return Err(StoreError::PushUnsupported("memory store in polling mode".to_string()));
        }
        let stream = BroadcastStream::new(self.changes.subscribe())
            .map(|item| item.map_err(|e| StoreError::Stream(e.to_string())));
        Ok(stream.boxed())
    }
}

#[async_trait]
impl ResultSink for MemoryStore {
    async fn store_result(&self, result: &ProbeResult) -> Result<(), StoreError> {
        self.results.lock().unwrap().push(result.clone());
        Ok(())
    }
}
