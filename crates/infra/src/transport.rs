//! Connection details for the content-addressed transport shared between the
//! storage service and the log store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use snapvault_core::SessionToken;

/// Header carrying the storage session token on transport requests.
pub const AUTH_HEADER: &str = "x-ipfs-ffs-auth";

const DEFAULT_PORT: u16 = 443;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("endpoint has no host: {0}")]
    MissingHost(String),
}

/// Where and how the log store reaches the storage service's transport node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportOptions {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub headers: BTreeMap<String, String>,
}

impl TransportOptions {
    /// Derive transport options from the storage control endpoint.
    ///
    /// The port falls back to 443 when the URL does not carry one explicitly.
    pub fn from_endpoint(endpoint: &Url, token: &SessionToken) -> Result<Self, TransportError> {
        let host = endpoint
            .host_str()
            .ok_or_else(|| TransportError::MissingHost(endpoint.to_string()))?;

        let mut headers = BTreeMap::new();
        headers.insert(AUTH_HEADER.to_string(), token.as_str().to_string());

        Ok(Self {
            host: host.to_string(),
            port: endpoint.port().unwrap_or(DEFAULT_PORT),
            protocol: endpoint.scheme().to_string(),
            headers,
        })
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.headers.get(AUTH_HEADER).map(String::as_str)
    }
}

/// Keep only multiaddrs a remote peer could plausibly dial.
///
/// Drops IPv6, QUIC, loopback and the common private IPv4 ranges.
pub fn filter_public_multiaddrs<I, S>(addresses: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    const BLOCKED: [&str; 6] = [
        "ip6",
        "quic",
        "127.0.0.1",
        "ip4/192.168",
        "ip4/10.",
        "ip4/172.1",
    ];

    addresses
        .into_iter()
        .map(|a| a.as_ref().to_string())
        .filter(|a| !BLOCKED.iter().any(|blocked| a.contains(blocked)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> SessionToken {
        SessionToken::new("ffs-token").unwrap()
    }

    #[test]
    fn options_from_explicit_port() {
        let endpoint = Url::parse("http://0.0.0.0:6002").unwrap();
        let opts = TransportOptions::from_endpoint(&endpoint, &token()).unwrap();

        assert_eq!(opts.host, "0.0.0.0");
        assert_eq!(opts.port, 6002);
        assert_eq!(opts.protocol, "http");
        assert_eq!(opts.auth_token(), Some("ffs-token"));
    }

    #[test]
    fn port_defaults_to_443() {
        let endpoint = Url::parse("https://powergate.example.com").unwrap();
        let opts = TransportOptions::from_endpoint(&endpoint, &token()).unwrap();

        assert_eq!(opts.host, "powergate.example.com");
        assert_eq!(opts.port, 443);
        assert_eq!(opts.protocol, "https");
    }

    #[test]
    fn endpoint_without_host_is_rejected() {
        let endpoint = Url::parse("unix:/var/run/powergate.sock").unwrap();
        assert!(matches!(
            TransportOptions::from_endpoint(&endpoint, &token()),
            Err(TransportError::MissingHost(_))
        ));
    }

    #[test]
    fn private_and_local_multiaddrs_are_filtered() {
        let addrs = [
            "/ip4/127.0.0.1/tcp/4001",
            "/ip4/192.168.1.20/tcp/4001",
            "/ip4/10.0.0.5/tcp/4001",
            "/ip4/172.17.0.2/tcp/4001",
            "/ip6/::1/tcp/4001",
            "/ip4/203.0.113.7/udp/4001/quic",
            "/ip4/203.0.113.7/tcp/4001",
        ];

        assert_eq!(filter_public_multiaddrs(addrs), vec!["/ip4/203.0.113.7/tcp/4001"]);
    }
}
