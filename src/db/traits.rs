//! Capabilities the runner consumes from its configuration store and result sink.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use super::models::{MonitorDefinition, ProbeResult};

/// Store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("monitor not found: {0}")]
    NotFound(String),
    #[error("invalid monitor {id}: {reason}")]
    InvalidMonitor { id: String, reason: String },
    #[error("change feed not supported: {0}")]
    PushUnsupported(String),
    #[error("change stream error: {0}")]
    Stream(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store is closed")]
    Closed,
}

/// Kind of change carried by a change-feed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Replace,
    Delete,
    /// Anything the store emits that the runner does not understand.
    Other(String),
}

impl From<&str> for ChangeOp {
    fn from(op: &str) -> Self {
        match op {
            "insert" => Self::Insert,
            "replace" | "update" => Self::Replace,
            "delete" => Self::Delete,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A single configuration change. Deletes carry only the id.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub id: String,
    pub definition: Option<MonitorDefinition>,
}

impl ChangeEvent {
    pub fn insert(definition: MonitorDefinition) -> Self {
        Self {
            op: ChangeOp::Insert,
            id: definition.id.clone(),
            definition: Some(definition),
        }
    }

    pub fn replace(definition: MonitorDefinition) -> Self {
        Self {
            op: ChangeOp::Replace,
            id: definition.id.clone(),
            definition: Some(definition),
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            op: ChangeOp::Delete,
            id: id.into(),
            definition: None,
        }
    }
}

/// Stream of change events; an `Err` item ends push reconciliation.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, StoreError>>;

/// Source of monitor definitions.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch every configured monitor.
    async fn fetch_all(&self) -> Result<Vec<MonitorDefinition>, StoreError>;

    /// Fetch one monitor; a missing id is `StoreError::NotFound`.
    async fn fetch_by_id(&self, id: &str) -> Result<MonitorDefinition, StoreError>;

    /// Subscribe to changes. `StoreError::PushUnsupported` selects polling.
    async fn watch(&self) -> Result<ChangeStream, StoreError>;

    /// Release the underlying connection.
    async fn close(&self) {}
}

/// Destination for probe results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store_result(&self, result: &ProbeResult) -> Result<(), StoreError>;
}
