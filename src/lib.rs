//! Pingboard - endpoint reachability monitor.
//!
//! Periodically probes a list of endpoints with ICMP echo and TCP connect
//! checks and keeps rolling latency and availability statistics per endpoint.

pub mod address;
pub mod config;
pub mod endpoint;
pub mod probe;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod signal;
