//! Configuration module for PulseTrail.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Values that fail to parse are logged and the default is kept.

use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::db::MonitorType;

const PREFIX: &str = "PULSETRAIL_";

/// Runner configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Path to the SQLite database file (default: "pulsetrail.db")
    pub db_path: String,
    /// JSON file of monitors upserted at startup
    pub seed_file: Option<String>,
    /// Consecutive failures before an alert fires (default: 3, min: 1)
    pub alert_fail_count: u32,
    /// Base of the deep link placed in alerts
    pub alert_link_baseurl: String,
    /// Webhook receiving alerts; alerting is off when unset
    pub alert_webhook_url: Option<String>,
    /// Interval of the polling reconciler (default: 10s)
    pub poll_interval: Duration,
    /// Skip the change feed and always poll
    pub use_polling: bool,
    /// Upper bound of the random start delay for new monitors (default: 10s)
    pub stagger_window: Duration,
    pub debug: DebugProtocols,
    /// Serve /metrics, /healthz and /api/monitors
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            db_path: "pulsetrail.db".to_string(),
            seed_file: None,
            alert_fail_count: 3,
            alert_link_baseurl: "http://localhost:3000".to_string(),
            alert_webhook_url: None,
            poll_interval: Duration::from_secs(10),
            use_polling: false,
            stagger_window: Duration::from_secs(10),
            debug: DebugProtocols::default(),
            metrics_enabled: false,
            metrics_port: 8080,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from the process environment.
    ///
    /// Environment variables (all prefixed `PULSETRAIL_`):
    /// - `DB_PATH`, `SEED_FILE`
    /// - `ALERT_FAIL_COUNT`, `ALERT_LINK_BASEURL`, `ALERT_WEBHOOK_URL`
    /// - `POLL_INTERVAL`, `USE_POLLING`, `STAGGER_WINDOW`
    /// - `DEBUG`: `true`/`all` or a comma list of monitor types
    /// - `METRICS_ENABLED`, `METRICS_PORT`
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(format!("{PREFIX}{key}")).ok())
    }

    /// Build a configuration from any key lookup. Keys are unprefixed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(path) = get("DB_PATH") {
            cfg.db_path = path;
        }
        cfg.seed_file = get("SEED_FILE");

        if let Some(count) = parse_or_warn::<u32>("ALERT_FAIL_COUNT", get("ALERT_FAIL_COUNT")) {
            cfg.alert_fail_count = count.max(1);
        }
        if let Some(base) = get("ALERT_LINK_BASEURL") {
            cfg.alert_link_baseurl = base;
        }
        cfg.alert_webhook_url = get("ALERT_WEBHOOK_URL");

        if let Some(d) = duration_or_warn("POLL_INTERVAL", get("POLL_INTERVAL")) {
            if d.is_zero() {
                tracing::warn!("{PREFIX}POLL_INTERVAL must be positive, keeping default");
            } else {
                cfg.poll_interval = d;
            }
        }
        if let Some(b) = bool_or_warn("USE_POLLING", get("USE_POLLING")) {
            cfg.use_polling = b;
        }
        if let Some(d) = duration_or_warn("STAGGER_WINDOW", get("STAGGER_WINDOW")) {
            cfg.stagger_window = d;
        }

        if let Some(debug) = get("DEBUG") {
            cfg.debug = DebugProtocols::parse(&debug);
        }

        if let Some(b) = bool_or_warn("METRICS_ENABLED", get("METRICS_ENABLED")) {
            cfg.metrics_enabled = b;
        }
        if let Some(port) = parse_or_warn::<u16>("METRICS_PORT", get("METRICS_PORT")) {
            cfg.metrics_port = port;
        }

        cfg
    }
}

fn parse_or_warn<T: FromStr>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Invalid {PREFIX}{key} '{}', keeping default", raw);
            None
        }
    }
}

fn duration_or_warn(key: &str, raw: Option<String>) -> Option<Duration> {
    let raw = raw?;
    match humantime::parse_duration(&raw) {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!("Invalid {PREFIX}{key} '{}': {}, keeping default", raw, e);
            None
        }
    }
}

fn bool_or_warn(key: &str, raw: Option<String>) -> Option<bool> {
    let raw = raw?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("Invalid {PREFIX}{key} '{}', keeping default", raw);
            None
        }
    }
}

/// Monitor types whose probe outputs are logged on every run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugProtocols {
    all: bool,
    types: HashSet<MonitorType>,
}

impl DebugProtocols {
    /// `true`/`all` selects every type; otherwise a comma list like `http,dns`.
    pub fn parse(raw: &str) -> Self {
        let mut out = Self::default();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.to_ascii_lowercase().as_str() {
                "true" | "all" | "*" => out.all = true,
                "false" | "none" => {}
                other => match other.parse::<MonitorType>() {
                    Ok(kind) => {
                        out.types.insert(kind);
                    }
                    Err(_) => tracing::warn!("Unknown monitor type '{}' in {PREFIX}DEBUG", part),
                },
            }
        }
        out
    }

    pub fn enabled_for(&self, kind: MonitorType) -> bool {
        self.all || self.types.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> RunnerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RunnerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = load(&[]);
        assert_eq!(cfg.db_path, "pulsetrail.db");
        assert_eq!(cfg.alert_fail_count, 3);
        assert_eq!(cfg.poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.stagger_window, Duration::from_secs(10));
        assert!(cfg.alert_webhook_url.is_none());
        assert!(!cfg.use_polling);
        assert!(!cfg.metrics_enabled);
        assert_eq!(cfg.metrics_port, 8080);
        assert!(!cfg.debug.enabled_for(MonitorType::Http));
    }

    #[test]
    fn test_overrides() {
        let cfg = load(&[
            ("DB_PATH", "/tmp/x.db"),
            ("ALERT_FAIL_COUNT", "5"),
            ("ALERT_WEBHOOK_URL", "http://hooks.local/alert"),
            ("POLL_INTERVAL", "1m30s"),
            ("USE_POLLING", "true"),
            ("STAGGER_WINDOW", "250ms"),
            ("METRICS_ENABLED", "1"),
            ("METRICS_PORT", "9100"),
        ]);
        assert_eq!(cfg.db_path, "/tmp/x.db");
        assert_eq!(cfg.alert_fail_count, 5);
        assert_eq!(cfg.alert_webhook_url.as_deref(), Some("http://hooks.local/alert"));
        assert_eq!(cfg.poll_interval, Duration::from_secs(90));
        assert!(cfg.use_polling);
        assert_eq!(cfg.stagger_window, Duration::from_millis(250));
        assert!(cfg.metrics_enabled);
        assert_eq!(cfg.metrics_port, 9100);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let cfg = load(&[
            ("ALERT_FAIL_COUNT", "many"),
            ("POLL_INTERVAL", "soon"),
            ("USE_POLLING", "maybe"),
            ("METRICS_PORT", "99999"),
            ("ALERT_WEBHOOK_URL", "   "),
        ]);
        assert_eq!(cfg.alert_fail_count, 3);
        assert_eq!(cfg.poll_interval, Duration::from_secs(10));
        assert!(!cfg.use_polling);
        assert_eq!(cfg.metrics_port, 8080);
        assert!(cfg.alert_webhook_url.is_none());
    }

    #[test]
    fn test_limits() {
        let cfg = load(&[("ALERT_FAIL_COUNT", "0"), ("POLL_INTERVAL", "0s")]);
        assert_eq!(cfg.alert_fail_count, 1);
        assert_eq!(cfg.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_debug_protocols() {
        let all = DebugProtocols::parse("true");
        assert!(all.enabled_for(MonitorType::Ping));
        assert!(all.enabled_for(MonitorType::Dns));

        let some = DebugProtocols::parse("http, DNS,bogus");
        assert!(some.enabled_for(MonitorType::Http));
        assert!(some.enabled_for(MonitorType::Dns));
        assert!(!some.enabled_for(MonitorType::Tcp));

        assert_eq!(DebugProtocols::parse("false"), DebugProtocols::default());
    }
}
