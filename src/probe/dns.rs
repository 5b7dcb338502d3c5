//! DNS probe implementation using raw UDP packets.
//!
//! A records without a custom `server` go through the system resolver; every
//! other lookup is a single UDP query to `server` or the first `nameserver`
//! in `/etc/resolv.conf`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::{millis, props, ProbeError, ProbeOutput};
use crate::db::MonitorDefinition;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Record types the probe can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Cname,
    Txt,
    Mx,
    Ns,
}

impl RecordType {
    fn qtype(&self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ns => 2,
            Self::Cname => 5,
            Self::Mx => 15,
            Self::Txt => 16,
        }
    }
}

impl FromStr for RecordType {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "A" => Ok(Self::A),
            "CNAME" => Ok(Self::Cname),
            "TXT" => Ok(Self::Txt),
            "MX" => Ok(Self::Mx),
            "NS" => Ok(Self::Ns),
            other => Err(ProbeError::Config(format!("invalid record type: {}", other))),
        }
    }
}

/// Address family filter for system A lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Network {
    Any,
    V4,
    V6,
}

impl Network {
    fn parse(raw: Option<&str>) -> Result<Self, ProbeError> {
        match raw {
            None | Some("ip") => Ok(Self::Any),
            Some("ip4") => Ok(Self::V4),
            Some("ip6") => Ok(Self::V6),
            Some(other) => Err(ProbeError::Config(format!("invalid network: {}", other))),
        }
    }

    fn allows(&self, ip: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => ip.is_ipv4(),
            Self::V6 => ip.is_ipv6(),
        }
    }
}

/// Resolve the monitor's target and report lookup latency and answers.
pub async fn run_dns_probe(monitor: &MonitorDefinition) -> Result<ProbeOutput, ProbeError> {
    let timeout = props::duration_or(monitor, "timeout", DEFAULT_TIMEOUT)?;
    let record_type: RecordType = monitor.property("type").unwrap_or("A").parse()?;
    let network = Network::parse(monitor.property("network"))?;
    let name = monitor.target.trim();

    let server = match (monitor.property("server"), record_type) {
        (Some(server), _) => Some(with_default_port(server)),
        (None, RecordType::A) => None,
        (None, _) => Some(system_nameserver()?),
    };

    let start = Instant::now();

    let lookup = async {
        match &server {
            None => lookup_system_a(name, network).await,
            Some(server) => query_server(server, name, record_type).await,
        }
    };
    let results = tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    let elapsed = millis(start.elapsed());

    let mut output = ProbeOutput {
        value: elapsed,
        ..Default::default()
    };
    output.outputs.insert("respTime".to_string(), elapsed.into());
    output
        .outputs
        .insert("resultCount".to_string(), (results.len() as i64).into());
    for (i, result) in results.into_iter().enumerate() {
        output.outputs.insert(format!("result{}", i + 1), result.into());
    }

    Ok(output)
}

async fn lookup_system_a(name: &str, network: Network) -> Result<Vec<String>, ProbeError> {
    let addrs = tokio::net::lookup_host((name, 0))
        .await
        .map_err(|e| ProbeError::Network(format!("lookup {}: {}", name, e)))?;

    let mut ips: Vec<String> = Vec::new();
    for addr in addrs {
        let ip = addr.ip();
        if network.allows(&ip) && !ips.contains(&ip.to_string()) {
            ips.push(ip.to_string());
        }
    }

    if ips.is_empty() {
        return Err(ProbeError::Network(format!("lookup {}: no addresses found", name)));
    }
    Ok(ips)
}

/// Append `:53` unless the server already names a port.
fn with_default_port(server: &str) -> String {
    if server.parse::<SocketAddr>().is_ok() {
        return server.to_string();
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return SocketAddr::new(ip, 53).to_string();
    }
    if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:53", server)
    }
}

/// First `nameserver` entry of the system resolver configuration.
fn system_nameserver() -> Result<String, ProbeError> {
    let conf = std::fs::read_to_string(RESOLV_CONF)
        .map_err(|e| ProbeError::Config(format!("failed to read {}: {}", RESOLV_CONF, e)))?;
    parse_resolv_conf(&conf)
        .map(|ip| SocketAddr::new(ip, 53).to_string())
        .ok_or_else(|| ProbeError::Config(format!("no nameserver in {}", RESOLV_CONF)))
}

fn parse_resolv_conf(conf: &str) -> Option<IpAddr> {
    conf.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse::<IpAddr>().ok())
        .next()
}

async fn query_server(
    server: &str,
    name: &str,
    record_type: RecordType,
) -> Result<Vec<String>, ProbeError> {
    let target = tokio::net::lookup_host(server)
        .await
        .map_err(|e| ProbeError::Network(format!("invalid server {}: {}", server, e)))?
        .next()
        .ok_or_else(|| ProbeError::Network(format!("invalid server {}", server)))?;

    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
    socket
        .connect(target)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let tx_id: u16 = rand::random();
    let packet = build_dns_query(tx_id, name, record_type)?;
    socket
        .send(&packet)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = [0u8; 4096];
    let n = socket
        .recv(&mut response)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;

    parse_dns_response(&response[..n], tx_id, name, record_type)
}

/// Build a DNS query packet for `name` with recursion desired.
fn build_dns_query(tx_id: u16, name: &str, record_type: RecordType) -> Result<Vec<u8>, ProbeError> {
    let flags: u16 = 0x0100; // Standard query, recursion desired

    // Header (12 bytes)
    let mut packet = Vec::with_capacity(64);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    // Question: length-prefixed labels
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Config(format!("invalid domain name: {}", name)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&record_type.qtype().to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS: IN

    Ok(packet)
}

fn read_u16(msg: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*msg.get(offset)?, *msg.get(offset + 1)?]))
}

/// Decode a possibly compressed name at `offset`.
///
/// Returns the dotted name and the offset just past it in the original stream.
fn read_name(msg: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *msg.get(pos)? as usize;
        if len == 0 {
            end.get_or_insert(pos + 1);
            break;
        }
        if len & 0xC0 == 0xC0 {
            jumps += 1;
            if jumps > 16 {
                return None;
            }
            let pointer = (read_u16(msg, pos)? & 0x3FFF) as usize;
            end.get_or_insert(pos + 2);
            pos = pointer;
            continue;
        }
        let label = msg.get(pos + 1..pos + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len;
    }

    Some((format!("{}.", labels.join(".")), end?))
}

/// Validate a response and extract the answers of the requested type.
fn parse_dns_response(
    msg: &[u8],
    tx_id: u16,
    name: &str,
    record_type: RecordType,
) -> Result<Vec<String>, ProbeError> {
    if msg.len() < 12 {
        return Err(ProbeError::Network(format!("response too short: {} bytes", msg.len())));
    }

    let resp_tx_id = u16::from_be_bytes([msg[0], msg[1]]);
    if resp_tx_id != tx_id {
        return Err(ProbeError::Network(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    // Check RCODE (lower 4 bits of byte 3)
    match msg[3] & 0x0F {
        0 => {}
        3 => return Err(ProbeError::Network(format!("lookup {}: no such host", name))),
        rcode => return Err(ProbeError::Network(format!("DNS error RCODE: {}", rcode))),
    }

    let malformed = || ProbeError::Network("malformed DNS response".to_string());
    let qd_count = read_u16(msg, 4).ok_or_else(malformed)?;
    let an_count = read_u16(msg, 6).ok_or_else(malformed)?;

    let mut pos = 12;
    for _ in 0..qd_count {
        let (_, next) = read_name(msg, pos).ok_or_else(malformed)?;
        pos = next + 4;
    }

    let mut results = Vec::new();
    for _ in 0..an_count {
        let (_, next) = read_name(msg, pos).ok_or_else(malformed)?;
        let rtype = read_u16(msg, next).ok_or_else(malformed)?;
        let rdlen = read_u16(msg, next + 8).ok_or_else(malformed)? as usize;
        let rdata_start = next + 10;
        let rdata = msg.get(rdata_start..rdata_start + rdlen).ok_or_else(malformed)?;
        pos = rdata_start + rdlen;

        if rtype != record_type.qtype() {
            continue;
        }

        let value = match record_type {
            RecordType::A => {
                let octets: [u8; 4] = rdata.try_into().map_err(|_| malformed())?;
                Ipv4Addr::from(octets).to_string()
            }
            RecordType::Cname | RecordType::Ns => read_name(msg, rdata_start).ok_or_else(malformed)?.0,
            RecordType::Mx => {
                let pref = read_u16(msg, rdata_start).ok_or_else(malformed)?;
                let (host, _) = read_name(msg, rdata_start + 2).ok_or_else(malformed)?;
                format!("{} {}", host, pref)
            }
            RecordType::Txt => {
                let mut text = String::new();
                let mut i = 0;
                while i < rdata.len() {
                    let len = rdata[i] as usize;
                    let chunk = rdata.get(i + 1..i + 1 + len).ok_or_else(malformed)?;
                    text.push_str(&String::from_utf8_lossy(chunk));
                    i += 1 + len;
                }
                text
            }
        };
        results.push(value);
    }

    if results.is_empty() {
        return Err(ProbeError::Network(format!(
            "lookup {}: no {:?} records found",
            name, record_type
        )));
    }

    Ok(results)
}
