//! A single probe round: resolve, probe, commit.

use super::EndpointUpdate;
use crate::config::MonitorConfig;
use crate::endpoint::{Endpoint, Field, TestResult};
use crate::probe::ProbeEngine;
use crate::registry::{Claim, Slot};
use crate::resolver::{Lookup, Resolve};
use crate::signal::StopToken;

use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// A test result was folded into the statistics.
    Recorded,
    /// The previous round for this endpoint is still outstanding.
    Busy,
    /// Both probe kinds are disabled.
    Disabled,
    /// The missing address half could not be resolved this time.
    Unresolved,
    /// The stop signal fired before the round could be committed.
    Cancelled,
    /// The endpoint was retargeted while the round was in flight.
    Stale,
}

/// Everything a round needs besides the slot it runs against.
pub(crate) struct RoundContext {
    pub engine: Arc<dyn ProbeEngine>,
    pub resolver: Arc<dyn Resolve>,
    pub config: Arc<MonitorConfig>,
    pub updates: broadcast::Sender<EndpointUpdate>,
    pub stop: StopToken,
}

/// Target and switches copied out of the endpoint at round start.
#[derive(Debug, Clone)]
struct Snapshot {
    hostname: Option<String>,
    ip: Option<IpAddr>,
    port: u16,
    allow_icmp: bool,
    allow_tcp: bool,
}

impl Snapshot {
    fn of(endpoint: &Endpoint) -> Self {
        Self {
            hostname: endpoint.hostname().map(str::to_string),
            ip: endpoint.ip(),
            port: endpoint.port(),
            allow_icmp: endpoint.allow_icmp(),
            allow_tcp: endpoint.allow_tcp(),
        }
    }

    fn targets(&self, endpoint: &Endpoint) -> bool {
        endpoint.hostname() == self.hostname.as_deref()
            && endpoint.ip() == self.ip
            && endpoint.port() == self.port
    }
}

impl RoundContext {
    pub(crate) fn publish(&self, index: u32, fields: Vec<Field>) {
        if fields.is_empty() {
            return;
        }
        // no subscribers is fine
        let _ = self.updates.send(EndpointUpdate { index, fields });
    }

    /// Apply `change` if the endpoint still has the snapshot's target.
    async fn commit<F>(&self, slot: &Slot, expected: &Snapshot, change: F) -> bool
    where
        F: FnOnce(&mut Endpoint) -> Vec<Field>,
    {
        let fields = {
            let mut endpoint = slot.lock().await;
            if !expected.targets(&endpoint) {
                return false;
            }
            change(&mut endpoint)
        };
        self.publish(slot.index(), fields);
        true
    }

    /// Fill in whichever address half is missing and return the IP to probe.
    async fn resolve(&self, slot: &Slot, snapshot: &mut Snapshot) -> Result<IpAddr, RoundOutcome> {
        let index = slot.index();

        match (snapshot.ip, snapshot.hostname.clone()) {
            (Some(ip), Some(_)) => Ok(ip),
            (Some(ip), None) => {
                let timeout = self.config.reverse_dns_timeout();
                let hostname = match self.resolver.resolve_host(ip, timeout, &self.stop).await {
                    Lookup::Found(name) => name,
                    Lookup::NotFound => ip.to_string(),
                    Lookup::Unavailable => {
                        tracing::debug!(
                            "Scheduler: Reverse lookup for endpoint {} unavailable",
                            index
                        );
                        return Err(RoundOutcome::Unresolved);
                    }
                };
                let committed = self
                    .commit(slot, snapshot, |e| {
                        e.set_hostname(Some(hostname.clone())).into_iter().collect()
                    })
                    .await;
                if !committed {
                    return Err(RoundOutcome::Stale);
                }
                snapshot.hostname = Some(hostname);
                Ok(ip)
            }
            (None, Some(hostname)) => {
                let timeout = self.config.dns_timeout();
                let ip = match self.resolver.resolve_ip(&hostname, timeout, &self.stop).await {
                    Lookup::Found(ip) => ip,
                    other => {
                        tracing::debug!(
                            "Scheduler: Could not resolve {} for endpoint {}: {:?}",
                            hostname,
                            index,
                            other
                        );
                        return Err(RoundOutcome::Unresolved);
                    }
                };
                let committed = self
                    .commit(slot, snapshot, |e| e.set_ip(Some(ip)).into_iter().collect())
                    .await;
                if !committed {
                    return Err(RoundOutcome::Stale);
                }
                snapshot.ip = Some(ip);
                Ok(ip)
            }
            (None, None) => {
                tracing::warn!("Scheduler: Endpoint {} has no address", index);
                Err(RoundOutcome::Unresolved)
            }
        }
    }
}

/// Run one round against the claimed slot.
pub(crate) async fn run_round(ctx: &RoundContext, claim: Claim) -> RoundOutcome {
    let slot = claim.slot();
    let mut snapshot = Snapshot::of(&*slot.lock().await);

    if !snapshot.allow_icmp && !snapshot.allow_tcp {
        return RoundOutcome::Disabled;
    }

    let ip = match ctx.resolve(slot, &mut snapshot).await {
        Ok(ip) => ip,
        Err(outcome) => return outcome,
    };

    let started = Utc::now();
    let icmp = async {
        if snapshot.allow_icmp {
            ctx.engine.icmp(ip, ctx.config.ping_timeout(), &ctx.stop).await
        } else {
            None
        }
    };
    let tcp = async {
        if snapshot.allow_tcp {
            ctx.engine
                .tcp(ip, snapshot.port, ctx.config.tcping_timeout(), &ctx.stop)
                .await
        } else {
            None
        }
    };
    let (icmp, tcp) = tokio::join!(icmp, tcp);

    let incomplete =
        (snapshot.allow_icmp && icmp.is_none()) || (snapshot.allow_tcp && tcp.is_none());
    if incomplete || ctx.stop.is_stopped() {
        tracing::debug!("Scheduler: Round for endpoint {} cancelled", slot.index());
        return RoundOutcome::Cancelled;
    }

    let result = TestResult {
        time: started,
        icmp,
        tcp,
    };
    if ctx.commit(slot, &snapshot, |e| e.apply(Some(result))).await {
        RoundOutcome::Recorded
    } else {
        tracing::debug!("Scheduler: Endpoint {} changed during round, discarding", slot.index());
        RoundOutcome::Stale
    }
}
