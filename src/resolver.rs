//! Forward and reverse DNS, bounded by a timeout and the stop signal.

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::{system_conf, TokioAsyncResolver};

use crate::signal::StopToken;

/// Outcome of a DNS lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    /// The lookup completed without an answer.
    NotFound,
    /// Timed out, cancelled, or the resolver failed. Callers must leave the
    /// field unset.
    Unavailable,
}

/// Resolves the missing half of an endpoint address.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Reverse lookup of `ip`.
    async fn resolve_host(
        &self,
        ip: IpAddr,
        timeout: Duration,
        stop: &StopToken,
    ) -> Lookup<String>;

    /// Forward lookup of `hostname`.
    async fn resolve_ip(
        &self,
        hostname: &str,
        timeout: Duration,
        stop: &StopToken,
    ) -> Lookup<IpAddr>;
}

/// Race `lookup` against `timeout` and `stop`.
async fn bounded<T, F>(what: &str, timeout: Duration, stop: &StopToken, lookup: F) -> Lookup<T>
where
    F: Future<Output = Lookup<T>>,
{
    tokio::select! {
        biased;
        _ = stop.stopped() => {
            tracing::debug!("DNS {}: cancelled", what);
            Lookup::Unavailable
        }
        res = time::timeout(timeout, lookup) => match res {
            Ok(found) => found,
            Err(_) => {
                tracing::debug!("DNS {}: timed out after {:?}", what, timeout);
                Lookup::Unavailable
            }
        }
    }
}

/// Only a completed lookup without records is `NotFound`. Timeouts and
/// transport failures leave the answer unknown.
fn classify_error<T>(what: &str, e: &ResolveError) -> Lookup<T> {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => {
            tracing::debug!("DNS {}: no records", what);
            Lookup::NotFound
        }
        _ => {
            tracing::debug!("DNS {}: {}", what, e);
            Lookup::Unavailable
        }
    }
}

/// Resolver backed by `trust-dns-resolver`.
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn new(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        }
    }

    /// Use the system's resolver configuration, falling back to the library
    /// defaults if it cannot be read.
    pub fn from_system_conf() -> Self {
        match system_conf::read_system_conf() {
            Ok((config, opts)) => Self::new(config, opts),
            Err(e) => {
                tracing::warn!("Failed to read system DNS config, using defaults: {}", e);
                Self::new(ResolverConfig::default(), ResolverOpts::default())
            }
        }
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn resolve_host(
        &self,
        ip: IpAddr,
        timeout: Duration,
        stop: &StopToken,
    ) -> Lookup<String> {
        let what = format!("PTR {}", ip);
        bounded(&what, timeout, stop, async {
            match self.inner.reverse_lookup(ip).await {
                Ok(names) => names
                    .iter()
                    .map(|name| name.to_string().trim_end_matches('.').to_string())
                    .find(|name| !name.is_empty())
                    .map_or(Lookup::NotFound, Lookup::Found),
                Err(e) => classify_error(&what, &e),
            }
        })
        .await
    }

    async fn resolve_ip(
        &self,
        hostname: &str,
        timeout: Duration,
        stop: &StopToken,
    ) -> Lookup<IpAddr> {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Lookup::Found(ip);
        }

        let what = format!("A/AAAA {}", hostname);
        bounded(&what, timeout, stop, async {
            match self.inner.lookup_ip(hostname).await {
                Ok(ips) => ips.iter().next().map_or(Lookup::NotFound, Lookup::Found),
                Err(e) => classify_error(&what, &e),
            }
        })
        .await
    }
}
