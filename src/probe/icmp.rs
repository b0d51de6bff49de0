//! ICMP echo probe with native sockets and command fallback.
//!
//! Native probes use blocking sockets in spawn_blocking for precise timing.
//! When neither RAW nor unprivileged DGRAM ICMP sockets can be opened, the
//! system `ping` binary is used instead.

use std::io::{ErrorKind, Read};
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{whole_millis, IcmpResult, ProbeError};
use crate::signal::StopToken;

const PACKET_LEN: usize = 64;
const ICMP_HEADER_LEN: usize = 8;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Generate a unique identifier for each echo request, so concurrent probes
/// to the same destination can tell their replies apart.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on Linux with ping_group_range set, or macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// A matching echo reply.
#[derive(Debug, Clone, PartialEq)]
struct EchoReply {
    rtt: Duration,
    ttl: Option<u8>,
    size: usize,
}

impl From<EchoReply> for IcmpResult {
    fn from(reply: EchoReply) -> Self {
        IcmpResult::success(whole_millis(reply.rtt), reply.ttl, reply.size)
    }
}

/// Send one echo request to `ip` and wait for its reply.
///
/// Returns `None` if `stop` fires before the attempt resolves. A blocking
/// attempt that is abandoned this way keeps its thread until its own timeout.
pub async fn run_icmp_probe(ip: IpAddr, timeout: Duration, stop: &StopToken) -> Option<IcmpResult> {
    let attempt = async {
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
        if capability == IcmpCapability::CommandOnly {
            return run_ping_command(ip, timeout).await;
        }

        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Err(ProbeError::Permission(reason)) => {
                tracing::warn!(
                    "Native ping to {} denied ({}), falling back to command",
                    ip,
                    reason
                );
                run_ping_command(ip, timeout).await
            }
            other => other,
        }
    };

    tokio::select! {
        biased;
        _ = stop.stopped() => {
            tracing::debug!("ICMPing {}: cancelled", ip);
            None
        }
        res = attempt => {
            let result = match res {
                Ok(reply) => {
                    tracing::debug!("ICMPing {}: {:?} ttl={:?}", ip, reply.rtt, reply.ttl);
                    IcmpResult::from(reply)
                }
                Err(e) => {
                    tracing::debug!("ICMPing {}: {}", ip, e);
                    IcmpResult::failed(e.status())
                }
            };
            Some(result)
        }
    }
}

/// Address-family specifics of an echo exchange.
#[derive(Debug, Clone, Copy)]
struct Family {
    domain: Domain,
    protocol: Protocol,
    request_type: u8,
    reply_type: u8,
    /// Error types that quote the offending request.
    error_types: [u8; 2],
    v6: bool,
}

const V4: Family = Family {
    domain: Domain::IPV4,
    protocol: Protocol::ICMPV4,
    request_type: 8,
    reply_type: 0,
    // destination unreachable, time exceeded
    error_types: [3, 11],
    v6: false,
};

const V6: Family = Family {
    domain: Domain::IPV6,
    protocol: Protocol::ICMPV6,
    request_type: 128,
    reply_type: 129,
    error_types: [1, 3],
    v6: true,
};

fn io_error(context: &str, e: std::io::Error) -> ProbeError {
    if e.kind() == ErrorKind::PermissionDenied {
        ProbeError::Permission(format!("{}: {}", context, e))
    } else {
        ProbeError::Network(format!("{}: {}", context, e))
    }
}

/// Blocking echo exchange. Runs on a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<EchoReply, ProbeError> {
    let family = if ip.is_ipv4() { V4 } else { V6 };

    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (socket, raw) = match Socket::new(family.domain, Type::RAW, Some(family.protocol)) {
        Ok(s) => (s, true),
        Err(_) => (
            Socket::new(family.domain, Type::DGRAM, Some(family.protocol))
                .map_err(|e| io_error("failed to create ICMP socket", e))?,
            false,
        ),
    };

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| io_error("failed to set timeout", e))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| io_error("failed to connect", e))?;

    let (identifier, sequence) = generate_ping_id();
    let packet = build_echo_request(&family, identifier, sequence);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| io_error("failed to send", e))?;

    let mut buf = [0u8; 1500];
    loop {
        let remaining = remaining_time(start.elapsed(), timeout)?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| io_error("failed to set timeout", e))?;

        let len = (&socket).read(&mut buf).map_err(|e| {
            if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                io_error("failed to receive", e)
            }
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        // The kernel rewrites the identifier of DGRAM echo requests, and only
        // delivers replies for this socket anyway.
        let expect_id = raw.then_some(identifier);
        match classify_reply(&family, &buf[..len], expect_id, sequence) {
            Reply::Echo { ttl, size } => {
                return Ok(EchoReply {
                    rtt: elapsed,
                    ttl,
                    size,
                })
            }
            Reply::Error(kind) => {
                return Err(ProbeError::Unexpected(format!("ICMP type {}", kind)));
            }
            Reply::Foreign => continue,
        }
    }
}

/// Time left to wait for a reply, or a timeout once none is left.
fn remaining_time(elapsed: Duration, timeout: Duration) -> Result<Duration, ProbeError> {
    timeout
        .checked_sub(elapsed)
        .filter(|d| !d.is_zero())
        .ok_or(ProbeError::Timeout(timeout))
}

/// What a received datagram means for the pending request.
#[derive(Debug, PartialEq)]
enum Reply {
    /// Our echo reply.
    Echo { ttl: Option<u8>, size: usize },
    /// An error message quoting our request.
    Error(u8),
    /// Somebody else's traffic.
    Foreign,
}

/// Returns the IPv4 header length if `buf` starts with one.
fn ipv4_header_len(buf: &[u8]) -> Option<usize> {
    if buf.first().map(|b| b >> 4) == Some(4) {
        Some(usize::from(buf[0] & 0x0f) * 4)
    } else {
        None
    }
}

fn echo_matches(icmp: &[u8], expect_id: Option<u16>, sequence: u16) -> bool {
    if icmp.len() < ICMP_HEADER_LEN {
        return false;
    }
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    seq == sequence && expect_id.map_or(true, |expected| expected == id)
}

fn classify_reply(family: &Family, buf: &[u8], expect_id: Option<u16>, sequence: u16) -> Reply {
    // RAW IPv4 sockets deliver the IP header too, DGRAM and IPv6 sockets don't
    let (icmp, ttl) = match (family.v6, ipv4_header_len(buf)) {
        (false, Some(ihl)) if buf.len() > ihl => (&buf[ihl..], Some(buf[8])),
        _ => (buf, None),
    };
    if icmp.len() < ICMP_HEADER_LEN {
        return Reply::Foreign;
    }

    let kind = icmp[0];
    if kind == family.reply_type {
        if echo_matches(icmp, expect_id, sequence) {
            return Reply::Echo {
                ttl,
                size: icmp.len() - ICMP_HEADER_LEN,
            };
        }
        return Reply::Foreign;
    }

    if family.error_types.contains(&kind) {
        let quoted = &icmp[ICMP_HEADER_LEN..];
        let inner_header = if family.v6 {
            Some(40)
        } else {
            ipv4_header_len(quoted)
        };
        if let Some(offset) = inner_header {
            if quoted.len() > offset
                && quoted[offset] == family.request_type
                && echo_matches(&quoted[offset..], expect_id, sequence)
            {
                return Reply::Error(kind);
            }
        }
    }

    Reply::Foreign
}

/// Build an echo request (type 8 or 128, code 0).
fn build_echo_request(family: &Family, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_LEN];

    packet[0] = family.request_type;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // The kernel fills in ICMPv6 checksums
    if !family.v6 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via command execution (fallback).
async fn run_ping_command(ip: IpAddr, timeout: Duration) -> Result<EchoReply, ProbeError> {
    // -W takes whole seconds
    let timeout_secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
    let mut command = Command::new("ping");
    if ip.is_ipv6() {
        command.arg("-6");
    }

    let started = Instant::now();
    let output = command
        .args(["-c", "1", "-W", &timeout_secs.to_string(), &ip.to_string()])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ping_failure(&stdout, &stderr, started.elapsed(), timeout));
    }

    let reply = parse_ping_output(&stdout)?;
    if reply.rtt >= timeout {
        return Err(ProbeError::Timeout(timeout));
    }
    Ok(reply)
}

/// Classify a failed `ping` run. Lost replies are timeouts.
fn ping_failure(stdout: &str, stderr: &str, elapsed: Duration, timeout: Duration) -> ProbeError {
    if elapsed >= timeout
        || stderr.contains("timeout")
        || stdout.contains("100% packet loss")
        || stdout.contains("100.0% packet loss")
    {
        return ProbeError::Timeout(timeout);
    }
    ProbeError::Command(format!("ping failed: {}", stdout.trim()))
}

/// Parse a `ping -c 1` transcript for the reply line.
fn parse_ping_output(output: &str) -> Result<EchoReply, ProbeError> {
    static REPLY: OnceLock<Regex> = OnceLock::new();
    static TTL: OnceLock<Regex> = OnceLock::new();
    static SIZE: OnceLock<Regex> = OnceLock::new();

    let reply = REPLY.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());
    let ttl = TTL.get_or_init(|| Regex::new(r"(?i)ttl=(?P<val>\d+)").unwrap());
    let size = SIZE.get_or_init(|| Regex::new(r"(?P<val>\d+) bytes from").unwrap());

    let millis = reply
        .captures(output)
        .and_then(|caps| caps["val"].parse::<f64>().ok())
        .ok_or_else(|| {
            ProbeError::Command(format!("failed to parse ping output: {}", output.trim()))
        })?;

    let ttl = ttl
        .captures(output)
        .and_then(|caps| caps["val"].parse::<u8>().ok());
    let size = size
        .captures(output)
        .and_then(|caps| caps["val"].parse::<usize>().ok())
        .map(|bytes| bytes.saturating_sub(ICMP_HEADER_LEN))
        .unwrap_or(0);

    Ok(EchoReply {
        rtt: Duration::from_secs_f64(millis / 1000.0),
        ttl,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeStatus;
    use crate::signal::StopSignal;
    use std::net::Ipv4Addr;

    fn ipv4_header(ttl: u8) -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0] = 0x45;
        header[8] = ttl;
        header
    }

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_echo_request(&V4, 0x1234, 0x0001);
        // A packet including its own checksum sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_checksum_odd_length() {
        assert_eq!(icmp_checksum(&[0xff]), 0x00ff);
    }

    #[test]
    fn test_build_echo_request() {
        let packet = build_echo_request(&V4, 0x1234, 0x0001);
        assert_eq!(packet.len(), PACKET_LEN);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);

        let packet = build_echo_request(&V6, 0x1234, 0x0001);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[2..4], [0, 0]);
    }

    #[test]
    fn test_classify_raw_v4_reply() {
        let mut reply = build_echo_request(&V4, 7, 9);
        reply[0] = 0;
        let mut datagram = ipv4_header(57);
        datagram.extend_from_slice(&reply);

        assert_eq!(
            classify_reply(&V4, &datagram, Some(7), 9),
            Reply::Echo {
                ttl: Some(57),
                size: PACKET_LEN - ICMP_HEADER_LEN
            }
        );
        assert_eq!(classify_reply(&V4, &datagram, Some(8), 9), Reply::Foreign);
        assert_eq!(classify_reply(&V4, &datagram, Some(7), 10), Reply::Foreign);
    }

    #[test]
    fn test_classify_dgram_ignores_identifier() {
        let mut reply = build_echo_request(&V4, 4242, 3);
        reply[0] = 0;
        assert_eq!(
            classify_reply(&V4, &reply, None, 3),
            Reply::Echo {
                ttl: None,
                size: PACKET_LEN - ICMP_HEADER_LEN
            }
        );
    }

    #[test]
    fn test_classify_unreachable_quoting_our_request() {
        let request = build_echo_request(&V4, 7, 9);
        let mut error = vec![3u8, 1, 0, 0, 0, 0, 0, 0];
        error.extend_from_slice(&ipv4_header(64));
        error.extend_from_slice(&request[..8]);

        assert_eq!(classify_reply(&V4, &error, Some(7), 9), Reply::Error(3));
        assert_eq!(classify_reply(&V4, &error, Some(7), 1), Reply::Foreign);
    }

    #[test]
    fn test_classify_v6_reply() {
        let mut reply = build_echo_request(&V6, 1, 2);
        reply[0] = 129;
        assert!(matches!(
            classify_reply(&V6, &reply, Some(1), 2),
            Reply::Echo { ttl: None, .. }
        ));
        // a request is not a reply
        assert_eq!(
            classify_reply(&V6, &build_echo_request(&V6, 1, 2), Some(1), 2),
            Reply::Foreign
        );
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let reply = parse_ping_output(output).unwrap();
        assert_eq!(whole_millis(reply.rtt), 12);
        assert_eq!(reply.ttl, Some(117));
        assert_eq!(reply.size, 56);
    }

    #[test]
    fn test_parse_ping_output_sub_millisecond() {
        let output = r#"PING 127.0.0.1 (127.0.0.1) 56(84) bytes of data.
64 bytes from 127.0.0.1: icmp_seq=1 ttl=64 time=0.041 ms

--- 127.0.0.1 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms"#;
        let reply = parse_ping_output(output).unwrap();
        assert_eq!(whole_millis(reply.rtt), 0);
        assert_eq!(reply.ttl, Some(64));
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(matches!(
            parse_ping_output("ping: unknown host"),
            Err(ProbeError::Command(_))
        ));
    }

    #[tokio::test]
    async fn test_icmp_probe_cancelled_yields_nothing() {
        let signal = StopSignal::new();
        signal.stop();
        let result = run_icmp_probe(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_millis(200),
            &signal.token(),
        )
        .await;
        assert!(result.is_none());
    }

    #[test]
    fn test_remaining_time() {
        let timeout = Duration::from_millis(300);
        assert_eq!(
            remaining_time(Duration::from_millis(100), timeout).unwrap(),
            Duration::from_millis(200)
        );

        for elapsed in [timeout, Duration::from_millis(450)] {
            let err = remaining_time(elapsed, timeout).unwrap_err();
            assert!(matches!(err, ProbeError::Timeout(t) if t == timeout));
            assert_eq!(err.status(), ProbeStatus::TimedOut);
        }
    }

    #[test]
    fn test_ping_failure_packet_loss_is_timeout() {
        let linux = "PING 192.0.2.1 (192.0.2.1) 56(84) bytes of data.\n\n\
                     --- 192.0.2.1 ping statistics ---\n\
                     1 packets transmitted, 0 received, 100% packet loss, time 0ms\n";
        let macos = "PING 192.0.2.1 (192.0.2.1): 56 data bytes\n\n\
                     --- 192.0.2.1 ping statistics ---\n\
                     1 packets transmitted, 0 packets received, 100.0% packet loss\n";
        let timeout = Duration::from_secs(3);

        for transcript in [linux, macos] {
            let err = ping_failure(transcript, "", Duration::from_millis(5), timeout);
            assert!(matches!(err, ProbeError::Timeout(_)), "{:?}", err);
            assert_eq!(err.status(), ProbeStatus::TimedOut);
        }

        let err = ping_failure("", "", timeout, timeout);
        assert!(matches!(err, ProbeError::Timeout(_)));
    }

    #[test]
    fn test_ping_failure_other_errors_are_unknown() {
        let err = ping_failure(
            "",
            "ping: connect: Network is unreachable",
            Duration::from_millis(1),
            Duration::from_secs(3),
        );
        assert!(matches!(err, ProbeError::Command(_)));
        assert_eq!(err.status(), ProbeStatus::Unknown);
    }
}
