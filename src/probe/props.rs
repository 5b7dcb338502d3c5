//! Typed access to a monitor's string property bag.

use std::time::Duration;

use super::ProbeError;
use crate::db::MonitorDefinition;

/// Read a duration property such as `timeout = "2s"`, or return the default.
pub fn duration_or(
    monitor: &MonitorDefinition,
    key: &str,
    default: Duration,
) -> Result<Duration, ProbeError> {
    match monitor.property(key) {
        Some(raw) => humantime::parse_duration(raw)
            .map_err(|e| ProbeError::Config(format!("invalid {} '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

/// Read a boolean property, accepting the usual spellings (`1`, `t`, `true`, ...).
pub fn bool_or(monitor: &MonitorDefinition, key: &str, default: bool) -> Result<bool, ProbeError> {
    match monitor.property(key) {
        Some(raw) => parse_bool(raw)
            .ok_or_else(|| ProbeError::Config(format!("invalid {} '{}': not a boolean", key, raw))),
        None => Ok(default),
    }
}

/// Read a positive integer property.
pub fn count_or(monitor: &MonitorDefinition, key: &str, default: u32) -> Result<u32, ProbeError> {
    match monitor.property(key) {
        Some(raw) => match raw.parse::<u32>() {
            Ok(0) => Err(ProbeError::Config(format!("invalid {} '{}': must be at least 1", key, raw))),
            Ok(n) => Ok(n),
            Err(e) => Err(ProbeError::Config(format!("invalid {} '{}': {}", key, raw, e))),
        },
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn monitor(props: &[(&str, &str)]) -> MonitorDefinition {
        MonitorDefinition {
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn test_duration_property() {
        let m = monitor(&[("timeout", "150ms"), ("bad", "soon")]);
        assert_eq!(duration_or(&m, "timeout", Duration::ZERO).unwrap(), Duration::from_millis(150));
        assert_eq!(duration_or(&m, "missing", Duration::from_secs(5)).unwrap(), Duration::from_secs(5));
        let err = duration_or(&m, "bad", Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("invalid bad 'soon'"));
    }

    #[test]
    fn test_bool_property() {
        let m = monitor(&[("a", "false"), ("b", "T"), ("c", "nope")]);
        assert!(!bool_or(&m, "a", true).unwrap());
        assert!(bool_or(&m, "b", false).unwrap());
        assert!(bool_or(&m, "missing", true).unwrap());
        assert!(bool_or(&m, "c", true).is_err());
    }

    #[test]
    fn test_count_property() {
        let m = monitor(&[("count", "5"), ("zero", "0"), ("neg", "-1")]);
        assert_eq!(count_or(&m, "count", 3).unwrap(), 5);
        assert_eq!(count_or(&m, "missing", 3).unwrap(), 3);
        assert!(count_or(&m, "zero", 3).is_err());
        assert!(count_or(&m, "neg", 3).is_err());
    }
}
