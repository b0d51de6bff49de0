//! Monitored endpoints and their rolling statistics.
//!
//! Every mutating operation returns the list of [`Field`]s whose values
//! changed, so an observer can redraw one row without re-reading the entity.

mod record;
mod stats;

pub use record::*;
pub use stats::*;

use crate::address::Target;
use crate::config::DEFAULT_PORT;
use crate::probe::{IcmpResult, TcpResult};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

/// An observable endpoint attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Hostname,
    Ip,
    Port,
    Description,
    AllowIcmp,
    AllowTcp,
    RememberIp,
    History,
    DisplayStatus,
    Icmp(StatField),
    Tcp(StatField),
}

/// An observable attribute of one probe kind's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatField {
    SucceedCount,
    FailedCount,
    SucceedRatio,
    FailedRatio,
    LastLatency,
    MaxLatency,
    MinLatency,
    AverageLatency,
    LastSucceedAt,
    LastFailedAt,
}

/// Tri-state row status derived from the latest recorded round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DisplayStatus {
    #[default]
    Unknown,
    Succeed,
    Failed,
}

/// Record of one probe round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub time: DateTime<Utc>,
    pub icmp: Option<IcmpResult>,
    pub tcp: Option<TcpResult>,
}

impl TestResult {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time,
            icmp: None,
            tcp: None,
        }
    }

    /// True when no sub-probe produced a result.
    pub fn is_empty(&self) -> bool {
        self.icmp.is_none() && self.tcp.is_none()
    }
}

/// Which address half a duplicate keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Keep the IP; the hostname is re-derived by reverse DNS.
    KeepIp,
    /// Keep the hostname; the IP is re-derived by forward DNS.
    KeepHostname,
}

/// One monitored target.
#[derive(Debug, Clone)]
pub struct Endpoint {
    index: u32,
    hostname: Option<String>,
    ip: Option<IpAddr>,
    port: u16,
    description: String,
    allow_icmp: bool,
    allow_tcp: bool,
    remember_ip: bool,
    icmp: ProbeStats,
    tcp: ProbeStats,
    history: Vec<TestResult>,
    display_status: DisplayStatus,
}

fn set_field<T: PartialEq>(slot: &mut T, value: T, field: Field) -> Option<Field> {
    if *slot == value {
        return None;
    }
    *slot = value;
    Some(field)
}

impl Endpoint {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            hostname: None,
            ip: None,
            port: DEFAULT_PORT,
            description: String::new(),
            allow_icmp: true,
            allow_tcp: true,
            remember_ip: true,
            icmp: ProbeStats::default(),
            tcp: ProbeStats::default(),
            history: Vec::new(),
            display_status: DisplayStatus::Unknown,
        }
    }

    pub fn from_target(index: u32, target: Target) -> Self {
        Self {
            hostname: target.hostname,
            ip: target.ip,
            port: target.port,
            ..Self::new(index)
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn allow_icmp(&self) -> bool {
        self.allow_icmp
    }

    pub fn allow_tcp(&self) -> bool {
        self.allow_tcp
    }

    pub fn remember_ip(&self) -> bool {
        self.remember_ip
    }

    /// Whether any sub-probe is enabled.
    pub fn is_enabled(&self) -> bool {
        self.allow_icmp || self.allow_tcp
    }

    pub fn icmp(&self) -> &ProbeStats {
        &self.icmp
    }

    pub fn tcp(&self) -> &ProbeStats {
        &self.tcp
    }

    pub fn history(&self) -> &[TestResult] {
        &self.history
    }

    pub fn display_status(&self) -> DisplayStatus {
        self.display_status
    }

    pub fn set_hostname(&mut self, hostname: Option<String>) -> Option<Field> {
        set_field(&mut self.hostname, hostname, Field::Hostname)
    }

    pub fn set_ip(&mut self, ip: Option<IpAddr>) -> Option<Field> {
        set_field(&mut self.ip, ip, Field::Ip)
    }

    pub fn set_port(&mut self, port: u16) -> Option<Field> {
        set_field(&mut self.port, port, Field::Port)
    }

    pub fn set_description(&mut self, description: impl Into<String>) -> Option<Field> {
        set_field(&mut self.description, description.into(), Field::Description)
    }

    pub fn set_allow_icmp(&mut self, allow: bool) -> Option<Field> {
        set_field(&mut self.allow_icmp, allow, Field::AllowIcmp)
    }

    pub fn set_allow_tcp(&mut self, allow: bool) -> Option<Field> {
        set_field(&mut self.allow_tcp, allow, Field::AllowTcp)
    }

    pub fn set_remember_ip(&mut self, remember: bool) -> Option<Field> {
        set_field(&mut self.remember_ip, remember, Field::RememberIp)
    }

    /// Point the endpoint at a new target. Statistics no longer describe the
    /// target, so they are reset.
    pub fn retarget(&mut self, target: Target) -> Vec<Field> {
        let mut changed: Vec<Field> = [
            self.set_hostname(target.hostname),
            self.set_ip(target.ip),
            self.set_port(target.port),
        ]
        .into_iter()
        .flatten()
        .collect();

        if !changed.is_empty() {
            changed.extend(self.reset());
        }
        changed
    }

    /// Clear counters and history and return to `Unknown`.
    pub fn reset(&mut self) -> Vec<Field> {
        let mut changed = Vec::new();

        if !self.history.is_empty() {
            self.history.clear();
            changed.push(Field::History);
        }
        changed.extend(self.icmp.reset().into_iter().map(Field::Icmp));
        changed.extend(self.tcp.reset().into_iter().map(Field::Tcp));
        changed.extend(set_field(
            &mut self.display_status,
            DisplayStatus::Unknown,
            Field::DisplayStatus,
        ));

        changed
    }

    /// Copy the configuration (never the statistics) into a new endpoint,
    /// keeping one address half so the other is re-derived on the next probe.
    pub fn duplicate(&self, policy: DuplicatePolicy) -> Endpoint {
        let (hostname, ip) = match policy {
            DuplicatePolicy::KeepIp => (None, self.ip),
            DuplicatePolicy::KeepHostname => (self.hostname.clone(), None),
        };

        Endpoint {
            hostname,
            ip,
            port: self.port,
            description: self.description.clone(),
            allow_icmp: self.allow_icmp,
            allow_tcp: self.allow_tcp,
            remember_ip: self.remember_ip,
            ..Endpoint::new(self.index)
        }
    }

    /// [`duplicate`](Self::duplicate) with the policy picked by `remember_ip`.
    pub fn duplicate_remembered(&self) -> Endpoint {
        let policy = if self.remember_ip {
            DuplicatePolicy::KeepIp
        } else {
            DuplicatePolicy::KeepHostname
        };
        self.duplicate(policy)
    }
}
