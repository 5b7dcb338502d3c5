//! Probe module for network monitoring.
//!
//! Supports HTTP, TCP, DNS, and Ping probes. Each probe reads its knobs from
//! the monitor's properties and yields a primary value plus named outputs.

mod cert;
mod dns;
mod http;
mod ping;
mod props;
mod tcp;

pub use dns::*;
pub use http::*;
pub use ping::*;
pub use tcp::*;

use std::time::Duration;
use thiserror::Error;

use crate::db::{MonitorDefinition, MonitorType, Outputs, ProbeResult};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// What a successful probe measured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeOutput {
    /// Primary signal in milliseconds.
    pub value: i64,
    pub outputs: Outputs,
}

/// Run the probe for `kind` against the monitor.
///
/// Never fails: configuration and transport errors become a `Failed` result
/// whose message is the error text.
pub async fn run_probe(kind: MonitorType, monitor: &MonitorDefinition) -> ProbeResult {
    let output = match kind {
        MonitorType::Http => run_http_probe(monitor).await,
        MonitorType::Tcp => run_tcp_probe(monitor).await,
        MonitorType::Ping => run_ping_probe(monitor).await,
        MonitorType::Dns => run_dns_probe(monitor).await,
    };

    match output {
        Ok(output) => {
            let mut result = ProbeResult::new(monitor);
            result.value = output.value;
            result.outputs = output.outputs;
            result
        }
        Err(e) => {
            tracing::warn!("Monitor '{}' {} probe failed: {}", monitor.name, kind, e);
            ProbeResult::failed(monitor, e.to_string())
        }
    }
}

/// Elapsed time as whole milliseconds.
fn millis(elapsed: Duration) -> i64 {
    elapsed.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Status;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_bad_property_is_failed_result() {
        let monitor = MonitorDefinition {
            id: "t".to_string(),
            name: "bad timeout".to_string(),
            monitor_type: "tcp".to_string(),
            target: "127.0.0.1:1".to_string(),
            properties: HashMap::from([("timeout".to_string(), "often".to_string())]),
            ..Default::default()
        };
        let result = run_probe(MonitorType::Tcp, &monitor).await;
        assert_eq!(result.status, Status::Failed);
        assert!(result.message.starts_with("invalid configuration: invalid timeout"));
        assert!(result.outputs.is_empty());
        assert_eq!(result.monitor_id, "t");
    }
}
