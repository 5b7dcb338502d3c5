//! HTTP probe implementation.

use chrono::Utc;
use regex::Regex;
use reqwest::tls::TlsInfo;
use reqwest::Method;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::cert::certificate_not_after;
use super::{millis, props, ProbeError, ProbeOutput};
use crate::db::{MonitorDefinition, OutputValue};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Run an HTTP probe against the monitor's target URL.
///
/// Outputs `status`, `respTime`, `bodyLen` and the raw `body`, plus
/// `certExpiryDays` over TLS and `regexMatch` when `bodyRegex` matches.
pub async fn run_http_probe(monitor: &MonitorDefinition) -> Result<ProbeOutput, ProbeError> {
    let method = match monitor.property("method") {
        Some(m) => Method::from_bytes(m.to_uppercase().as_bytes())
            .map_err(|_| ProbeError::Config(format!("invalid method '{}'", m)))?,
        None => Method::GET,
    };
    let timeout = props::duration_or(monitor, "timeout", DEFAULT_TIMEOUT)?;
    let validate_tls = props::bool_or(monitor, "validateTLS", true)?;

    let headers: HashMap<String, String> = match monitor.property("headers") {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| ProbeError::Config(format!("invalid headers JSON: {}", e)))?,
        None => HashMap::new(),
    };

    let body_regex = match monitor.property("bodyRegex") {
        Some(raw) => Some(
            Regex::new(raw).map_err(|e| ProbeError::Config(format!("invalid bodyRegex: {}", e)))?,
        ),
        None => None,
    };

    let url = if monitor.target.starts_with("http://") || monitor.target.starts_with("https://") {
        monitor.target.clone()
    } else {
        format!("http://{}", monitor.target)
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!validate_tls)
        .tls_info(true)
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let mut request = client.request(method, &url);
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = monitor.properties.get("body").filter(|b| !b.is_empty()) {
        request = request.body(body.clone());
    }

    let start = Instant::now();

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    let status = response.status().as_u16();
    let cert_days = response
        .extensions()
        .get::<TlsInfo>()
        .and_then(|info| info.peer_certificate())
        .and_then(certificate_not_after)
        .map(|not_after| (not_after - Utc::now()).num_days());

    // Read the full body to measure complete transfer time
    let bytes = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;
    let elapsed = millis(start.elapsed());
    let body = String::from_utf8_lossy(&bytes).into_owned();

    let mut output = ProbeOutput {
        value: elapsed,
        ..Default::default()
    };
    let outputs = &mut output.outputs;
    outputs.insert("status".to_string(), i64::from(status).into());
    outputs.insert("respTime".to_string(), elapsed.into());
    outputs.insert("bodyLen".to_string(), (bytes.len() as i64).into());

    if let Some(days) = cert_days {
        tracing::debug!("Monitor '{}' certificate expires in {} days", monitor.name, days);
        outputs.insert("certExpiryDays".to_string(), days.into());
    }

    if let Some(re) = &body_regex {
        if let Some(value) = extract_regex_match(re, &body) {
            outputs.insert("regexMatch".to_string(), value);
        }
    }

    outputs.insert("body".to_string(), body.into());

    Ok(output)
}

/// First capture group of `re` in `body`, as a float when it parses as one.
fn extract_regex_match(re: &Regex, body: &str) -> Option<OutputValue> {
    let caps = re.captures(body)?;
    let text = caps.get(1)?.as_str();
    Some(match text.trim().parse::<f64>() {
        Ok(num) => OutputValue::Float(num),
        Err(_) => OutputValue::Str(text.to_string()),
    })
}
