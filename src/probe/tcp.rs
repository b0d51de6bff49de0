//! TCP connect probe.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use super::{whole_millis, ProbeStatus, TcpResult};
use crate::signal::StopToken;

/// Time a TCP handshake to `ip:port`.
///
/// Returns `None` if `stop` fires before the connection attempt resolves.
pub async fn run_tcp_probe(
    ip: IpAddr,
    port: u16,
    timeout: Duration,
    stop: &StopToken,
) -> Option<TcpResult> {
    let addr = SocketAddr::new(ip, port);
    timed_connect(addr, timeout, stop, TcpStream::connect(addr)).await
}

async fn timed_connect<S, F>(
    addr: SocketAddr,
    timeout: Duration,
    stop: &StopToken,
    connect: F,
) -> Option<TcpResult>
where
    F: Future<Output = io::Result<S>>,
{
    let start = Instant::now();

    tokio::select! {
        biased;
        _ = stop.stopped() => {
            tracing::debug!("TCPing {}: cancelled", addr);
            None
        }
        res = time::timeout(timeout, connect) => {
            let result = match res {
                Ok(Ok(_stream)) => {
                    let rtt = whole_millis(start.elapsed());
                    tracing::debug!("TCPing {}: {}ms", addr, rtt);
                    TcpResult::success(rtt)
                }
                Ok(Err(e)) => {
                    tracing::debug!("TCPing {}: failed: {}", addr, e);
                    TcpResult::failed(ProbeStatus::BadDestination)
                }
                Err(_) => {
                    tracing::debug!("TCPing {}: timed out after {:?}", addr, timeout);
                    TcpResult::failed(ProbeStatus::TimedOut)
                }
            };
            Some(result)
        }
    }
}
