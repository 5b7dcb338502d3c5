//! SQLite database store implementation.
//!
//! SQLite has no cross-process change notification, and monitors are
//! usually written by other processes sharing the file. `watch` therefore
//! reports `PushUnsupported` and a runner over this store always uses the
//! polling reconciler. An in-process feed would only cover this process's
//! own writes, so none is offered. The push strategy serves stores that
//! do have a change feed.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::models::*;
use super::traits::{ChangeStream, ConfigStore, ResultSink, StoreError};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const MONITOR_COLUMNS: &str =
    "id, name, type, target, interval, enabled, rule, properties, updated_at";

/// Thread-safe SQLite store for monitor definitions and results.
pub struct Store {
    conn: Mutex<Option<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(Some(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;

        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    // --- Monitor CRUD ---

    /// Insert a monitor or overwrite the existing one with the same id.
    pub fn upsert_monitor(&self, monitor: &MonitorDefinition) -> Result<(), StoreError> {
        let properties = serde_json::to_string(&monitor.properties)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO monitors (id, name, type, target, interval, enabled, rule, properties, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                 name=excluded.name, type=excluded.type, target=excluded.target,
                 interval=excluded.interval, enabled=excluded.enabled, rule=excluded.rule,
                 properties=excluded.properties, updated_at=excluded.updated_at",
                params![
                    monitor.id,
                    monitor.name,
                    monitor.monitor_type,
                    monitor.target,
                    monitor.interval,
                    monitor.enabled,
                    monitor.rule,
                    properties,
                    monitor.updated_at.format(TIME_FORMAT).to_string(),
                ],
            )?;
            Ok(())
        })
    }

    /// Get all monitors. Rows that do not decode are logged and left out.
    pub fn get_monitors(&self) -> Result<Vec<MonitorDefinition>, StoreError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM monitors ORDER BY id",
                MONITOR_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], MonitorRow::from_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(rows)
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_definition() {
                Ok(monitor) => Some(monitor),
                Err(e) => {
                    tracing::warn!("Skipping monitor: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Get a monitor by ID.
    pub fn get_monitor(&self, id: &str) -> Result<MonitorDefinition, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM monitors WHERE id = ?1", MONITOR_COLUMNS),
                params![id],
                MonitorRow::from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
        })?
        .into_definition()
    }

    /// Delete a monitor. Its stored results are kept.
    pub fn delete_monitor(&self, id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM monitors WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    /// Upsert every monitor in a JSON array file. Returns the number imported.
    pub fn import_monitors<P: AsRef<Path>>(&self, path: P) -> Result<usize, StoreError> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let monitors: Vec<MonitorDefinition> = serde_json::from_str(&data)?;
        for monitor in &monitors {
            self.upsert_monitor(monitor)?;
        }
        Ok(monitors.len())
    }

    // --- Results ---

    /// Append a single result.
    pub fn add_result(&self, result: &ProbeResult) -> Result<(), StoreError> {
        let outputs = serde_json::to_string(&result.outputs)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO results (date, monitor_id, monitor_name, monitor_target, status, value, message, outputs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    result.timestamp.format(TIME_FORMAT).to_string(),
                    result.monitor_id,
                    result.monitor_name,
                    result.monitor_target,
                    result.status.code(),
                    result.value,
                    result.message,
                    outputs,
                ],
            )?;
            Ok(())
        })
    }

    /// Drop the connection; later calls fail with `StoreError::Closed`.
    pub fn shutdown(&self) {
        match self.lock() {
            Ok(mut guard) => {
                if let Some(conn) = guard.take() {
                    if let Err((_, e)) = conn.close() {
                        tracing::error!("Failed to close database: {}", e);
                    }
                }
            }
            Err(e) => tracing::error!("Failed to close database: {}", e),
        }
    }
}

#[async_trait]
impl ConfigStore for Store {
    async fn fetch_all(&self) -> Result<Vec<MonitorDefinition>, StoreError> {
        self.get_monitors()
    }

    async fn fetch_by_id(&self, id: &str) -> Result<MonitorDefinition, StoreError> {
        self.get_monitor(id)
    }

    async fn watch(&self) -> Result<ChangeStream, StoreError> {
        Err(StoreError::PushUnsupported(
            "SQLite has no cross-process change feed".to_string(),
        ))
    }

    async fn close(&self) {
        self.shutdown();
    }
}

#[async_trait]
impl ResultSink for Store {
    async fn store_result(&self, result: &ProbeResult) -> Result<(), StoreError> {
        self.add_result(result)
    }
}

/// A `monitors` row before its text columns are decoded.
struct MonitorRow {
    definition: MonitorDefinition,
    properties: String,
    updated_at: String,
}

impl MonitorRow {
    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            definition: MonitorDefinition {
                id: row.get(0)?,
                name: row.get(1)?,
                monitor_type: row.get(2)?,
                target: row.get(3)?,
                interval: row.get(4)?,
                enabled: row.get(5)?,
                rule: row.get(6)?,
                ..Default::default()
            },
            properties: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    /// Rows with an unreadable timestamp or properties blob are invalid
    /// configuration, never defaulted.
    fn into_definition(self) -> Result<MonitorDefinition, StoreError> {
        let mut definition = self.definition;
        let id = definition.id.clone();
        let invalid = |reason: String| StoreError::InvalidMonitor {
            id: id.clone(),
            reason,
        };

        definition.updated_at = parse_db_time(&self.updated_at)
            .ok_or_else(|| invalid(format!("unreadable updated_at '{}'", self.updated_at)))?;
        definition.properties = parse_properties(&self.properties)
            .map_err(|e| invalid(format!("invalid properties: {}", e)))?;
        Ok(definition)
    }
}

/// Properties are stored as a JSON object of strings. An empty column is no properties.
fn parse_properties(raw: &str) -> Result<HashMap<String, String>, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(raw)
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
