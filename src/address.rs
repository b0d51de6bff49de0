//! Endpoint address parsing.
//!
//! Grammar, tried in order:
//!
//! 1. `[H]:P`: bracketed host with a 1-5 digit port
//! 2. `[H]`: bracketed host, default port
//! 3. `H:P`: `P` is whatever follows the *last* colon, if it is a valid port
//! 4. `H`: the whole token, default port
//!
//! Rule 3 makes bare IPv6 literals ambiguous: in
//! `2409:8a55:260:1a60:a183:ee9e:98c3:df85:2080` the trailing `2080` is taken
//! as the port, and `2607:f8b0::2004` is rejected because `2004` is split off
//! and `2607:f8b0:` is no address. IPv6 addresses must be bracketed to be read
//! unambiguously.

use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::config::DEFAULT_PORT;
use crate::endpoint::Endpoint;

/// Address parse errors. Public entry points collapse these into `None`.
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("empty address")]
    Empty,
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    #[error("invalid host {0:?}")]
    InvalidHost(String),
    #[error("{0:?} is not an IP address")]
    NotAnIp(String),
}

/// A parsed but not necessarily resolved target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub hostname: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl Target {
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            hostname: Some(ip.to_string()),
            ip: Some(ip),
            port,
        }
    }

    pub fn from_hostname(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ip: None,
            port,
        }
    }
}

/// Parse a 1-5 digit port in `1..=65535`.
fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || s.len() > 5 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

/// Split a token into its host part and port.
fn split_host_port(token: &str, default_port: u16) -> Result<(&str, u16), ParseError> {
    static BRACKETED: OnceLock<Regex> = OnceLock::new();
    static BRACKETED_BARE: OnceLock<Regex> = OnceLock::new();

    let bracketed =
        BRACKETED.get_or_init(|| Regex::new(r"^\[(?P<host>.*)\]:(?P<port>\d{1,5})$").unwrap());
    let bracketed_bare = BRACKETED_BARE.get_or_init(|| Regex::new(r"^\[(?P<host>.*)\]$").unwrap());

    let token = token.trim();
    if token.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Some(caps) = bracketed.captures(token) {
        let port = caps.name("port").map_or("", |m| m.as_str());
        let port = parse_port(port).ok_or_else(|| ParseError::InvalidPort(token.to_string()))?;
        let host = caps.name("host").map_or("", |m| m.as_str());
        return Ok((host, port));
    }

    if let Some(caps) = bracketed_bare.captures(token) {
        let host = caps.name("host").map_or("", |m| m.as_str());
        return Ok((host, default_port));
    }

    if let Some((host, port)) = token.rsplit_once(':') {
        if let Some(port) = parse_port(port) {
            return Ok((host, port));
        }
    }

    Ok((token, default_port))
}

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && !host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '[' | ']' | ':' | '/'))
}

/// Parse a literal `ip:port` token. Hostnames are rejected.
pub fn try_parse_strict(token: &str, default_port: u16) -> Result<SocketAddr, ParseError> {
    let (host, port) = split_host_port(token, default_port)?;
    let ip = host
        .parse::<IpAddr>()
        .map_err(|_| ParseError::NotAnIp(host.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

/// Parse a token whose host may be an IP address or an unresolved hostname.
pub fn try_parse_permissive(token: &str, default_port: u16) -> Result<Target, ParseError> {
    let (host, port) = split_host_port(token, default_port)?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(Target::from_ip(ip, port));
    }
    if !is_valid_hostname(host) {
        return Err(ParseError::InvalidHost(host.to_string()));
    }
    Ok(Target::from_hostname(host, port))
}

/// Strict variant with the default port, for validating pasted `ip:port` text.
pub fn parse_strict(token: &str) -> Option<SocketAddr> {
    try_parse_strict(token, DEFAULT_PORT).ok()
}

/// Permissive variant with the default port.
pub fn parse_permissive(token: &str) -> Option<Target> {
    try_parse_permissive(token, DEFAULT_PORT).ok()
}

/// Build a new endpoint from a user-supplied address token.
pub fn parse_address(token: &str, index: u32) -> Option<Endpoint> {
    parse_permissive(token).map(|target| Endpoint::from_target(index, target))
}

/// Bulk import of an address list.
///
/// One endpoint per non-blank line, `ADDRESS [DESCRIPTION]`. Lines that do not
/// parse are skipped. Indices are assigned consecutively from `first_index`.
pub fn import_endpoints(text: &str, first_index: u32) -> Vec<Endpoint> {
    let mut endpoints = Vec::new();
    let mut index = first_index;

    for line in text.split(['\r', '\n']) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (token, description) = match line.split_once(char::is_whitespace) {
            Some((token, rest)) => (token, rest.trim()),
            None => (line, ""),
        };

        match try_parse_permissive(token, DEFAULT_PORT) {
            Ok(target) => {
                let mut endpoint = Endpoint::from_target(index, target);
                endpoint.set_description(description);
                endpoints.push(endpoint);
                match index.checked_add(1) {
                    Some(next) => index = next,
                    None => {
                        tracing::warn!("Import: endpoint index space exhausted");
                        break;
                    }
                }
            }
            Err(e) => tracing::warn!("Import: skipping line {:?}: {}", line, e),
        }
    }

    endpoints
}
