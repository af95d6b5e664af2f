use eyre::{Result, format_err};
use std::net::IpAddr;

pub mod dns;

/// How Ingress hosts are resolved to bind addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostResolver {
    /// the system resolver
    Lookup,
    /// a specific DNS server
    Server { host: String, port: u16 },
}

impl std::str::FromStr for HostResolver {
    type Err = String;

    /// `LOOKUP`, or a DNS server as `host[:port]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "LOOKUP" {
            return Ok(Self::Lookup);
        }
        let parse_port = |port: &str| {
            (port.parse::<u16>()).map_err(|e| format!("invalid port in {s:?}: {e}"))
        };
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let Some((host, rest)) = rest.split_once(']') else {
                return Err(format!("invalid DNS server {s:?}"));
            };
            match rest.strip_prefix(':') {
                Some(port) => (host, parse_port(port)?),
                None if rest.is_empty() => (host, dns::DNS_PORT),
                None => return Err(format!("invalid DNS server {s:?}")),
            }
        } else {
            match s.split_once(':') {
                Some((host, port)) if !port.contains(':') => (host, parse_port(port)?),
                _ => (s, dns::DNS_PORT),
            }
        };
        if host.is_empty() {
            return Err(format!("invalid DNS server {s:?}"));
        }
        Ok(Self::Server {
            host: host.to_string(),
            port,
        })
    }
}

impl HostResolver {
    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let addrs = match self {
            Self::Lookup => dns::lookup(host).await?,
            Self::Server { host: server, port } => dns::query(server, *port, host).await?,
        };
        (addrs.into_iter().next()).ok_or_else(|| format_err!("no address found for {host}"))
    }
}
