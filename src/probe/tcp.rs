//! TCP connect probe implementation.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::{millis, props, ProbeError, ProbeOutput};
use crate::db::MonitorDefinition;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Dial `host:port` and report the connect time and the peer address.
pub async fn run_tcp_probe(monitor: &MonitorDefinition) -> Result<ProbeOutput, ProbeError> {
    let timeout = props::duration_or(monitor, "timeout", DEFAULT_TIMEOUT)?;

    let start = Instant::now();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(monitor.target.as_str()))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("dial tcp {}: {}", monitor.target, e)))?;
    let elapsed = millis(start.elapsed());

    let peer = stream
        .peer_addr()
        .map_err(|e| ProbeError::Network(format!("failed to read peer address: {}", e)))?;

    let mut output = ProbeOutput {
        value: elapsed,
        ..Default::default()
    };
    output.outputs.insert("respTime".to_string(), elapsed.into());
    output
        .outputs
        .insert("ipAddress".to_string(), peer.ip().to_string().into());

    Ok(output)
}
