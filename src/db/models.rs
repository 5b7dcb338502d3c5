//! Monitor and result model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Shortest interval a monitor may be scheduled at.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// A configured health check, as held by the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorDefinition {
    pub id: String,
    pub name: String,
    /// Raw type string; unknown types are kept so they can be reported and skipped.
    #[serde(rename = "type")]
    pub monitor_type: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub interval: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for MonitorDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            monitor_type: String::new(),
            target: String::new(),
            interval: String::new(),
            enabled: false,
            rule: String::new(),
            properties: HashMap::new(),
            updated_at: Utc::now(),
        }
    }
}

impl MonitorDefinition {
    /// The probe kind, or `None` if the type string is not recognised.
    pub fn kind(&self) -> Option<MonitorType> {
        self.monitor_type.parse().ok()
    }

    /// Parse and validate the scheduling interval.
    pub fn interval_duration(&self) -> Result<Duration, String> {
        let interval = humantime::parse_duration(self.interval.trim())
            .map_err(|e| format!("invalid interval '{}': {}", self.interval, e))?;
        if interval < MIN_INTERVAL {
            return Err(format!("interval '{}' is less than 1s", self.interval));
        }
        Ok(interval)
    }

    /// Look up a non-empty property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Supported probe kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    Http,
    Tcp,
    Ping,
    Dns,
}

impl MonitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Ping => "ping",
            Self::Dns => "dns",
        }
    }
}

impl fmt::Display for MonitorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "tcp" => Ok(Self::Tcp),
            "ping" => Ok(Self::Ping),
            "dns" => Ok(Self::Dns),
            other => Err(format!("unknown monitor type: {}", other)),
        }
    }
}

/// Outcome of a single check. Ordered so that `Ok < Error < Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Probe succeeded and the rule, if any, held.
    Ok = 0,
    /// Probe succeeded but the rule was violated.
    Error = 1,
    /// Probe could not complete, or the rule could not be evaluated.
    Failed = 2,
}

impl Status {
    pub fn code(&self) -> i64 {
        *self as i64
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Error => "error",
            Status::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A single named probe output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl OutputValue {
    /// Numeric view used by gauges; strings have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Str(_) => None,
        }
    }
}

impl From<i64> for OutputValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for OutputValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for OutputValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&str> for OutputValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// Named outputs of a probe, ordered for stable logging and storage.
pub type Outputs = BTreeMap<String, OutputValue>;

/// Result of one monitor run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub timestamp: DateTime<Utc>,
    pub status: Status,
    /// Primary signal, in milliseconds for every probe kind.
    pub value: i64,
    pub message: String,
    pub monitor_id: String,
    pub monitor_name: String,
    pub monitor_target: String,
    pub outputs: Outputs,
}

impl ProbeResult {
    /// A fresh OK result for the given monitor with no outputs yet.
    pub fn new(monitor: &MonitorDefinition) -> Self {
        Self {
            timestamp: Utc::now(),
            status: Status::Ok,
            value: 0,
            message: String::new(),
            monitor_id: monitor.id.clone(),
            monitor_name: monitor.name.clone(),
            monitor_target: monitor.target.clone(),
            outputs: Outputs::new(),
        }
    }

    /// A failed result carrying the error text.
    pub fn failed(monitor: &MonitorDefinition, message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            message: message.into(),
            ..Self::new(monitor)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}
