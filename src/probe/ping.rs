//! Ping probe implementation with native ICMP (high-precision) and command fallback.
//!
//! Uses one blocking socket per probe inside spawn_blocking so each echo is
//! timed without scheduler jitter.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{props, ProbeError, ProbeOutput};
use crate::db::MonitorDefinition;

const DEFAULT_COUNT: u32 = 3;
const DEFAULT_INTERVAL: Duration = Duration::from_millis(150);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Smallest `-i` an unprivileged `ping` command accepts.
const MIN_COMMAND_INTERVAL: Duration = Duration::from_millis(200);

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter, shared so concurrent probes never reuse a sequence.
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // Try DGRAM (unprivileged on Linux with ping_group_range set, or macOS)
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Round-trip statistics for one probe run.
#[derive(Debug, Clone, Default, PartialEq)]
struct PingStats {
    transmitted: u32,
    received: u32,
    min_ms: f64,
    avg_ms: f64,
    max_ms: f64,
}

impl PingStats {
    fn from_rtts(transmitted: u32, rtts: &[Duration]) -> Self {
        let ms: Vec<f64> = rtts.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        if ms.is_empty() {
            return Self {
                transmitted,
                ..Default::default()
            };
        }
        Self {
            transmitted,
            received: ms.len() as u32,
            min_ms: ms.iter().copied().fold(f64::INFINITY, f64::min),
            max_ms: ms.iter().copied().fold(0.0, f64::max),
            avg_ms: ms.iter().sum::<f64>() / ms.len() as f64,
        }
    }

    fn packet_loss(&self) -> f64 {
        if self.transmitted == 0 {
            return 100.0;
        }
        let lost = self.transmitted.saturating_sub(self.received);
        f64::from(lost) * 100.0 / f64::from(self.transmitted)
    }
}

/// Send `count` echo requests to the monitor's target.
///
/// Losing every packet is still a successful probe: the loss shows up in
/// `packetLoss` and is left to the monitor's rule.
pub async fn run_ping_probe(monitor: &MonitorDefinition) -> Result<ProbeOutput, ProbeError> {
    let count = props::count_or(monitor, "count", DEFAULT_COUNT)?;
    let interval = props::duration_or(monitor, "interval", DEFAULT_INTERVAL)?;
    let timeout = props::duration_or(monitor, "timeout", DEFAULT_TIMEOUT)?;

    let ip = resolve_address(monitor.target.trim()).await?;
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    let stats = if capability == IcmpCapability::Native {
        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, count, interval, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Ok(stats) => stats,
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    ip,
                    msg
                );
                run_ping_command(ip, count, interval, timeout).await?
            }
            Err(e) => return Err(e),
        }
    } else {
        run_ping_command(ip, count, interval, timeout).await?
    };

    let mut output = ProbeOutput {
        value: stats.avg_ms.round() as i64,
        ..Default::default()
    };
    let outputs = &mut output.outputs;
    outputs.insert("minRtt".to_string(), stats.min_ms.into());
    outputs.insert("maxRtt".to_string(), stats.max_ms.into());
    outputs.insert("avgRtt".to_string(), stats.avg_ms.into());
    outputs.insert("packetLoss".to_string(), stats.packet_loss().into());
    outputs.insert("packetsRecv".to_string(), i64::from(stats.received).into());
    outputs.insert("ipAddress".to_string(), ip.to_string().into());

    Ok(output)
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((address, 0))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// Open an ICMP socket for `ip`, RAW first (privileged) then DGRAM.
///
/// Returns the socket and whether it is RAW.
fn open_icmp_socket(ip: IpAddr) -> Result<(Socket, bool), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    if let Ok(socket) = Socket::new(domain, Type::RAW, Some(protocol)) {
        return Ok((socket, true));
    }
    Socket::new(domain, Type::DGRAM, Some(protocol))
        .map(|socket| (socket, false))
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ProbeError::Network(format!("Permission denied: {}", e))
            } else {
                ProbeError::Network(format!("Failed to create ICMP socket: {}", e))
            }
        })
}

/// Run the echo sequence on a dedicated thread.
fn run_blocking_ping(
    ip: IpAddr,
    count: u32,
    interval: Duration,
    timeout: Duration,
) -> Result<PingStats, ProbeError> {
    let (socket, raw) = open_icmp_socket(ip)?;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let mut rtts = Vec::with_capacity(count as usize);

    for i in 0..count {
        if i > 0 {
            std::thread::sleep(interval);
        }

        let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let packet = match ip {
            IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
            IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
        };

        // Start timing just before send
        let start = Instant::now();
        socket.send(&packet).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ProbeError::Network(format!("Permission denied: {}", e))
            } else {
                ProbeError::Network(format!("Failed to send: {}", e))
            }
        })?;

        if let Some(rtt) = await_reply(&socket, ip.is_ipv4(), raw, identifier, sequence, start, timeout)? {
            rtts.push(rtt);
        }
    }

    Ok(PingStats::from_rtts(count, &rtts))
}

/// Wait for the reply to one echo request. `None` means it was lost.
fn await_reply(
    socket: &Socket,
    v4: bool,
    raw: bool,
    identifier: u16,
    sequence: u16,
    start: Instant,
    timeout: Duration,
) -> Result<Option<Duration>, ProbeError> {
    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    loop {
        let remaining = match timeout.checked_sub(start.elapsed()) {
            Some(r) if !r.is_zero() => r,
            _ => return Ok(None),
        };
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(None)
            }
            Err(e) => return Err(ProbeError::Network(format!("Failed to receive: {}", e))),
        };
        // Stop timing immediately after receive
        let elapsed = start.elapsed();

        // SAFETY: recv initialized the first `len` bytes
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        if is_echo_reply(data, v4, raw, identifier, sequence) {
            return Ok(Some(elapsed));
        }
    }
}

/// Whether `data` is the echo reply for `(identifier, sequence)`.
///
/// RAW IPv4 sockets deliver the IP header too. DGRAM sockets have their
/// identifier rewritten by the kernel, so only the sequence is compared.
fn is_echo_reply(data: &[u8], v4: bool, raw: bool, identifier: u16, sequence: u16) -> bool {
    let offset = if v4 && raw && data.first().map(|b| b >> 4) == Some(4) {
        usize::from(data[0] & 0x0F) * 4
    } else {
        0
    };
    let Some(icmp) = data.get(offset..offset + 8) else {
        return false;
    };

    let reply_type = if v4 { 0 } else { 129 };
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    icmp[0] == reply_type && reply_seq == sequence && (!raw || reply_id == identifier)
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = echo_request(8, identifier, sequence);
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    echo_request(128, identifier, sequence)
}

fn echo_request(icmp_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload
    packet[0] = icmp_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());
    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [odd] => u32::from(*odd) << 8,
            _ => 0,
        })
        .sum();

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via command execution (fallback).
async fn run_ping_command(
    ip: IpAddr,
    count: u32,
    interval: Duration,
    timeout: Duration,
) -> Result<PingStats, ProbeError> {
    let interval_secs = interval.max(MIN_COMMAND_INTERVAL).as_secs_f64();
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args([
            "-c",
            &count.to_string(),
            "-i",
            &format!("{:.3}", interval_secs),
            "-W",
            &timeout_secs.to_string(),
            &ip.to_string(),
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    // Exit status is non-zero on total loss, which is still a measurement.
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ping_output(&stdout).ok_or_else(|| {
        let stderr = String::from_utf8_lossy(&output.stderr);
        ProbeError::Command(format!("ping failed: {}{}", stdout.trim(), stderr.trim()))
    })
}

/// Parse the summary of a Linux or macOS `ping` run.
fn parse_ping_output(output: &str) -> Option<PingStats> {
    static COUNTS: OnceLock<Regex> = OnceLock::new();
    let counts = COUNTS.get_or_init(|| {
        Regex::new(r"(\d+) packets transmitted, (\d+) (?:packets )?received").unwrap()
    });

    // "rtt min/avg/max/mdev" (Linux) or "round-trip min/avg/max/stddev" (macOS)
    static RTT: OnceLock<Regex> = OnceLock::new();
    let rtt = RTT.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)")
            .unwrap()
    });

    let caps = counts.captures(output)?;
    let mut stats = PingStats {
        transmitted: caps[1].parse().ok()?,
        received: caps[2].parse().ok()?,
        ..Default::default()
    };

    if let Some(caps) = rtt.captures(output) {
        stats.min_ms = caps[1].parse().ok()?;
        stats.avg_ms = caps[2].parse().ok()?;
        stats.max_ms = caps[3].parse().ok()?;
    }

    Some(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_icmp_checksum() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        // A packet carrying its own checksum sums to zero.
        assert_eq!(icmp_checksum(&packet), 0);
        assert_eq!(icmp_checksum(&[0x08, 0x00, 0x00, 0x00, 0x12, 0x34, 0x00, 0x01]), 0xE5CA);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence

        let v6 = build_icmpv6_echo_request(0x1234, 0x0002);
        assert_eq!(v6[0], 128);
        assert_eq!(v6[2..4], [0, 0]);
    }

    #[test]
    fn test_is_echo_reply() {
        let mut reply = vec![0u8; 8];
        reply[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        reply[6..8].copy_from_slice(&7u16.to_be_bytes());
        assert!(is_echo_reply(&reply, true, false, 0x1234, 7));
        assert!(!is_echo_reply(&reply, true, false, 0x1234, 8));
        // DGRAM sockets ignore the identifier
        assert!(is_echo_reply(&reply, true, false, 0x9999, 7));

        // RAW IPv4 delivers a 20-byte IP header first
        let mut raw = vec![0x45];
        raw.extend_from_slice(&[0u8; 19]);
        raw.extend_from_slice(&reply);
        assert!(is_echo_reply(&raw, true, true, 0x1234, 7));
        assert!(!is_echo_reply(&raw, true, true, 0x9999, 7));

        let mut v6 = reply.clone();
        v6[0] = 129;
        assert!(is_echo_reply(&v6, false, false, 0x1234, 7));
        assert!(!is_echo_reply(&reply, false, false, 0x1234, 7));
        assert!(!is_echo_reply(&[0u8; 4], true, false, 0, 0));
    }

    #[test]
    fn test_stats_from_rtts() {
        let stats = PingStats::from_rtts(
            4,
            &[Duration::from_millis(10), Duration::from_millis(30), Duration::from_millis(20)],
        );
        assert_eq!(stats.received, 3);
        assert!((stats.min_ms - 10.0).abs() < 1e-9);
        assert!((stats.max_ms - 30.0).abs() < 1e-9);
        assert!((stats.avg_ms - 20.0).abs() < 1e-9);
        assert!((stats.packet_loss() - 25.0).abs() < 1e-9);

        let lost = PingStats::from_rtts(3, &[]);
        assert_eq!(lost.received, 0);
        assert_eq!(lost.avg_ms, 0.0);
        assert_eq!(lost.packet_loss(), 100.0);
    }

    #[test]
    fn test_parse_ping_output_linux_summary() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms
64 bytes from 8.8.8.8: icmp_seq=3 ttl=117 time=14.1 ms

--- 8.8.8.8 ping statistics ---
3 packets transmitted, 2 received, 33.3333% packet loss, time 302ms
rtt min/avg/max/mdev = 12.300/13.200/14.100/0.900 ms"#;
        let stats = parse_ping_output(output).unwrap();
        assert_eq!(stats.transmitted, 3);
        assert_eq!(stats.received, 2);
        assert!((stats.min_ms - 12.3).abs() < 1e-9);
        assert!((stats.avg_ms - 13.2).abs() < 1e-9);
        assert!((stats.max_ms - 14.1).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let stats = parse_ping_output(output).unwrap();
        assert_eq!(stats.received, 1);
        assert!((stats.avg_ms - 17.906).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_total_loss() {
        let output = "--- 10.9.9.9 ping statistics ---\n3 packets transmitted, 0 received, 100% packet loss, time 2040ms\n";
        let stats = parse_ping_output(output).unwrap();
        assert_eq!(stats.received, 0);
        assert_eq!(stats.packet_loss(), 100.0);
        assert_eq!(parse_ping_output("ping: unknown host"), None);
    }

    #[tokio::test]
    async fn test_ping_probe_rejects_bad_count() {
        let monitor = MonitorDefinition {
            monitor_type: "ping".to_string(),
            target: "127.0.0.1".to_string(),
            properties: HashMap::from([("count".to_string(), "0".to_string())]),
            ..Default::default()
        };
        assert!(matches!(run_ping_probe(&monitor).await, Err(ProbeError::Config(_))));
    }
}
