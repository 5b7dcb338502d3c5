//! Alert delivery.

mod webhook;

pub use webhook::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::{MonitorDefinition, ProbeResult, Status};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("template error: {0}")]
    Template(#[from] askama::Error),
    #[error("receiver rejected alert: {0}")]
    Rejected(String),
}

/// Everything a notifier needs to describe a monitor that crossed its threshold.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub subject: String,
    pub monitor_id: String,
    pub monitor_name: String,
    pub monitor_type: String,
    pub target: String,
    pub status: Status,
    pub message: String,
    pub value: i64,
    pub failures: u32,
    pub timestamp: DateTime<Utc>,
    pub link: String,
}

impl Alert {
    /// Build an alert; the deep link is `<link_base>/#monitor/<id>`.
    pub fn new(
        monitor: &MonitorDefinition,
        result: &ProbeResult,
        failures: u32,
        link_base: &str,
    ) -> Self {
        Self {
            subject: format!("Pulsetrail alert for: {}", monitor.name),
            monitor_id: monitor.id.clone(),
            monitor_name: monitor.name.clone(),
            monitor_type: monitor.monitor_type.clone(),
            target: monitor.target.clone(),
            status: result.status,
            message: result.message.clone(),
            value: result.value,
            failures,
            timestamp: result.timestamp,
            link: format!("{}/#monitor/{}", link_base.trim_end_matches('/'), monitor.id),
        }
    }
}

/// Sends alerts somewhere a human will see them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}
