//! Persisted form of an endpoint.

use super::Endpoint;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// The configuration half of an [`Endpoint`], as stored in the endpoint list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    pub index: u32,
    pub hostname: Option<String>,
    pub ip: Option<IpAddr>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "allowICMP", default = "enabled")]
    pub allow_icmp: bool,
    #[serde(rename = "allowTCP", default = "enabled")]
    pub allow_tcp: bool,
    #[serde(default = "enabled")]
    pub remember_ip: bool,
}

fn default_port() -> u16 {
    crate::config::DEFAULT_PORT
}

fn enabled() -> bool {
    true
}

impl From<&Endpoint> for EndpointRecord {
    fn from(e: &Endpoint) -> Self {
        Self {
            index: e.index,
            hostname: e.hostname.clone(),
            ip: e.ip,
            port: e.port,
            description: e.description.clone(),
            allow_icmp: e.allow_icmp,
            allow_tcp: e.allow_tcp,
            remember_ip: e.remember_ip,
        }
    }
}

impl From<EndpointRecord> for Endpoint {
    fn from(r: EndpointRecord) -> Self {
        Endpoint {
            hostname: r.hostname,
            ip: r.ip,
            port: r.port,
            description: r.description,
            allow_icmp: r.allow_icmp,
            allow_tcp: r.allow_tcp,
            remember_ip: r.remember_ip,
            ..Endpoint::new(r.index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_json_shape() {
        let mut endpoint = Endpoint::new(2);
        endpoint.set_ip(Some("2001:db8::1".parse().unwrap()));
        endpoint.set_allow_tcp(false);

        let json = serde_json::to_value(EndpointRecord::from(&endpoint)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "index": 2,
                "hostname": null,
                "ip": "2001:db8::1",
                "port": 443,
                "description": "",
                "allowICMP": true,
                "allowTCP": false,
                "rememberIp": true
            })
        );
    }

    #[test]
    fn test_record_defaults_for_missing_fields() {
        let record: EndpointRecord =
            serde_json::from_str(r#"{"index": 7, "hostname": "example.com", "ip": null}"#).unwrap();
        let endpoint = Endpoint::from(record);

        assert_eq!(endpoint.index(), 7);
        assert_eq!(endpoint.hostname(), Some("example.com"));
        assert_eq!(endpoint.port(), 443);
        assert!(endpoint.allow_icmp() && endpoint.allow_tcp() && endpoint.remember_ip());
    }

    #[test]
    fn test_invalid_ip_is_rejected() {
        let res = serde_json::from_str::<EndpointRecord>(
            r#"{"index": 1, "hostname": null, "ip": "999.1.1.1"}"#,
        );
        assert!(res.is_err());
    }
}
