//! Probe module for endpoint monitoring.
//!
//! Supports ICMP echo and TCP connect probes. Transport errors never leave
//! this module: every attempt ends in a [`ProbeStatus`], or in `None` when the
//! stop signal fired first.

mod icmp;
mod tcp;

pub use icmp::*;
pub use tcp::*;

use crate::signal::StopToken;

use async_trait::async_trait;
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Probe error types. Internal to probe implementations; callers only ever
/// see the [`ProbeStatus`] they are translated into.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("unexpected reply: {0}")]
    Unexpected(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    pub fn status(&self) -> ProbeStatus {
        match self {
            ProbeError::Timeout(_) => ProbeStatus::TimedOut,
            _ => ProbeStatus::Unknown,
        }
    }
}

/// Outcome of a single sub-probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeStatus {
    Success,
    TimedOut,
    BadDestination,
    Unknown,
}

impl ProbeStatus {
    pub fn is_success(self) -> bool {
        self == ProbeStatus::Success
    }
}

/// Result of one ICMP echo attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IcmpResult {
    pub status: ProbeStatus,
    /// Round trip in whole milliseconds, 0 unless `status` is `Success`.
    pub rtt: u64,
    pub ttl: Option<u8>,
    /// Echo payload bytes carried by the reply.
    pub reply_size: usize,
}

impl IcmpResult {
    pub fn success(rtt: u64, ttl: Option<u8>, reply_size: usize) -> Self {
        Self {
            status: ProbeStatus::Success,
            rtt,
            ttl,
            reply_size,
        }
    }

    pub fn failed(status: ProbeStatus) -> Self {
        Self {
            status,
            rtt: 0,
            ttl: None,
            reply_size: 0,
        }
    }
}

/// Result of one TCP connect attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TcpResult {
    pub status: ProbeStatus,
    /// Connect time in whole milliseconds, 0 unless `status` is `Success`.
    pub rtt: u64,
}

impl TcpResult {
    pub fn success(rtt: u64) -> Self {
        Self {
            status: ProbeStatus::Success,
            rtt,
        }
    }

    pub fn failed(status: ProbeStatus) -> Self {
        Self { status, rtt: 0 }
    }
}

/// Executes sub-probes against an already resolved address.
///
/// Implementations return `None` only when `stop` fired before the attempt
/// resolved; such results must never be recorded.
#[async_trait]
pub trait ProbeEngine: Send + Sync {
    async fn icmp(&self, ip: IpAddr, timeout: Duration, stop: &StopToken) -> Option<IcmpResult>;

    async fn tcp(
        &self,
        ip: IpAddr,
        port: u16,
        timeout: Duration,
        stop: &StopToken,
    ) -> Option<TcpResult>;
}

/// Probe engine backed by real sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetProber;

#[async_trait]
impl ProbeEngine for NetProber {
    async fn icmp(&self, ip: IpAddr, timeout: Duration, stop: &StopToken) -> Option<IcmpResult> {
        run_icmp_probe(ip, timeout, stop).await
    }

    async fn tcp(
        &self,
        ip: IpAddr,
        port: u16,
        timeout: Duration,
        stop: &StopToken,
    ) -> Option<TcpResult> {
        run_tcp_probe(ip, port, timeout, stop).await
    }
}

/// Convert an elapsed duration into whole milliseconds, rounded to nearest.
pub(crate) fn whole_millis(elapsed: Duration) -> u64 {
    ((elapsed.as_micros() + 500) / 1000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ProbeError::Timeout(Duration::from_secs(1)).status(),
            ProbeStatus::TimedOut
        );
        assert_eq!(
            ProbeError::Network("boom".into()).status(),
            ProbeStatus::Unknown
        );
        assert_eq!(
            ProbeError::Unexpected("type 3".into()).status(),
            ProbeStatus::Unknown
        );
    }

    #[test]
    fn test_whole_millis_rounds() {
        assert_eq!(whole_millis(Duration::from_micros(12_499)), 12);
        assert_eq!(whole_millis(Duration::from_micros(12_500)), 13);
        assert_eq!(whole_millis(Duration::ZERO), 0);
    }

    #[test]
    fn test_failed_results_carry_no_latency() {
        let icmp = IcmpResult::failed(ProbeStatus::TimedOut);
        assert_eq!(icmp.rtt, 0);
        assert!(icmp.ttl.is_none());
        let tcp = TcpResult::failed(ProbeStatus::BadDestination);
        assert!(!tcp.status.is_success());
    }
}
