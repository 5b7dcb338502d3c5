//! Per-monitor Prometheus gauges.
//!
//! Each monitor gets one gauge family `pulsetrail_<name>` with constant
//! `id` and `type` labels and a `result` label holding `_status`, `_value`
//! or the name of a numeric output.

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::db::{MonitorDefinition, ProbeResult};

const NAMESPACE: &str = "pulsetrail";

/// Shared by every family so monitors whose names collide differ only in
/// their `id` label.
const HELP: &str = "Latest probe result of a monitor";

pub struct MetricsRegistry {
    registry: Registry,
    gauges: Mutex<HashMap<String, GaugeVec>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            gauges: Mutex::new(HashMap::new()),
        }
    }

    fn gauges(&self) -> MutexGuard<'_, HashMap<String, GaugeVec>> {
        self.gauges.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a result, registering the monitor's gauge on first use.
    pub fn update(&self, monitor: &MonitorDefinition, result: &ProbeResult) {
        let mut gauges = self.gauges();

        if !gauges.contains_key(&monitor.id) {
            match self.register(monitor) {
                Ok(gauge) => {
                    gauges.insert(monitor.id.clone(), gauge);
                }
                Err(e) => {
                    tracing::warn!("Error registering gauge for '{}': {}", monitor.name, e);
                    return;
                }
            }
        }
        let Some(gauge) = gauges.get(&monitor.id) else {
            return;
        };

        gauge.with_label_values(&["_status"]).set(result.status.code() as f64);
        gauge.with_label_values(&["_value"]).set(result.value as f64);
        for (key, value) in &result.outputs {
            if let Some(v) = value.as_f64() {
                gauge.with_label_values(&[key.as_str()]).set(v);
            }
        }
    }

    fn register(&self, monitor: &MonitorDefinition) -> Result<GaugeVec, prometheus::Error> {
        let opts = Opts::new(metric_name(monitor), HELP)
        .namespace(NAMESPACE)
        .const_label("id", monitor.id.as_str())
        .const_label("type", monitor.monitor_type.as_str());

        let gauge = GaugeVec::new(opts, &["result"])?;
        self.registry.register(Box::new(gauge.clone()))?;
        Ok(gauge)
    }

    /// Drop a monitor's gauges. Unknown ids are ignored.
    pub fn remove(&self, id: &str) {
        if let Some(gauge) = self.gauges().remove(id) {
            if let Err(e) = self.registry.unregister(Box::new(gauge)) {
                tracing::warn!("Error unregistering gauge for {}: {}", id, e);
            }
        }
    }

    /// Prometheus text exposition of every registered gauge.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Lower-cased monitor name with anything outside `[a-z0-9_]` replaced by `_`.
fn metric_name(monitor: &MonitorDefinition) -> String {
    let source = if monitor.name.trim().is_empty() {
        &monitor.id
    } else {
        &monitor.name
    };
    source
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{OutputValue, Status};

    fn monitor(id: &str, name: &str) -> MonitorDefinition {
        MonitorDefinition {
            id: id.to_string(),
            name: name.to_string(),
            monitor_type: "http".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_metric_name() {
        assert_eq!(metric_name(&monitor("1", "Main Site")), "main_site");
        assert_eq!(metric_name(&monitor("1", "api-v2.prod")), "api_v2_prod");
        assert_eq!(metric_name(&monitor("abc", " ")), "abc");
    }

    #[test]
    fn test_update_and_render() {
        let metrics = MetricsRegistry::new();
        let m = monitor("m1", "Main Site");
        let mut result = ProbeResult::new(&m);
        result.status = Status::Error;
        result.value = 42;
        result.outputs.insert("status".to_string(), OutputValue::Int(503));
        result.outputs.insert("body".to_string(), OutputValue::Str("x".to_string()));

        metrics.update(&m, &result);
        let text = metrics.render().unwrap();

        assert!(text.contains(r#"pulsetrail_main_site{id="m1",result="_status",type="http"} 1"#));
        assert!(text.contains(r#"pulsetrail_main_site{id="m1",result="_value",type="http"} 42"#));
        assert!(text.contains(r#"pulsetrail_main_site{id="m1",result="status",type="http"} 503"#));
        assert!(!text.contains(r#"result="body""#));
    }

    #[test]
    fn test_colliding_names_are_both_exported() {
        let metrics = MetricsRegistry::new();
        let web = monitor("m1", "edge");
        let dns = MonitorDefinition {
            monitor_type: "dns".to_string(),
            ..monitor("m2", "Edge")
        };
        metrics.update(&web, &ProbeResult::new(&web));
        metrics.update(&dns, &ProbeResult::new(&dns));

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"pulsetrail_edge{id="m1",result="_status",type="http"} 0"#));
        assert!(text.contains(r#"pulsetrail_edge{id="m2",result="_status",type="dns"} 0"#));
        assert_eq!(metrics.gauges().len(), 2);
    }

    #[test]
    fn test_remove_unregisters() {
        let metrics = MetricsRegistry::new();
        let m = monitor("m1", "gone");
        metrics.update(&m, &ProbeResult::new(&m));
        assert!(metrics.render().unwrap().contains("pulsetrail_gone"));

        metrics.remove("m1");
        metrics.remove("never-registered");
        assert!(!metrics.render().unwrap().contains("pulsetrail_gone"));

        // Re-registering after removal works
        metrics.update(&m, &ProbeResult::new(&m));
        assert!(metrics.render().unwrap().contains("pulsetrail_gone"));
    }
}
