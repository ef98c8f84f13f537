use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use anyhow::anyhow;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            _ => Err(anyhow!("unknown network: {}", s)),
        }
    }
}

/// A destination as seen by an inbound: either a resolved socket address or
/// a domain name that still needs resolving.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocksAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl SocksAddr {
    pub fn any() -> Self {
        SocksAddr::Ip(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }

    pub fn port(&self) -> u16 {
        match self {
            SocksAddr::Ip(addr) => addr.port(),
            SocksAddr::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            SocksAddr::Ip(addr) => addr.ip().to_string(),
            SocksAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            SocksAddr::Domain(domain, _) => Some(domain),
            SocksAddr::Ip(_) => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            SocksAddr::Ip(addr) => Some(addr.ip()),
            SocksAddr::Domain(..) => None,
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, SocksAddr::Domain(..))
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocksAddr::Ip(addr) => write!(f, "{}", addr),
            SocksAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for SocksAddr {
    fn from(addr: SocketAddr) -> Self {
        SocksAddr::Ip(addr)
    }
}

impl From<(IpAddr, u16)> for SocksAddr {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        SocksAddr::Ip(SocketAddr::new(ip, port))
    }
}

impl From<(&str, u16)> for SocksAddr {
    fn from((host, port): (&str, u16)) -> Self {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        match host.parse::<IpAddr>() {
            Ok(ip) => SocksAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => SocksAddr::Domain(host.trim_end_matches('.').to_ascii_lowercase(), port),
        }
    }
}

impl FromStr for SocksAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(SocksAddr::Ip(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing port in address: {}", s))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| anyhow!("invalid port in address {}: {}", s, e))?;
        if host.is_empty() {
            return Err(anyhow!("missing host in address: {}", s));
        }
        Ok(SocksAddr::from((host, port)))
    }
}

/// Process attribution attached by an external sniffer.
#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    pub name: Option<String>,
    pub path: Option<String>,
    pub package_name: Option<String>,
    pub user: Option<String>,
    pub user_id: Option<u32>,
}

/// Per-connection metadata the router decides on.
#[derive(Debug, Clone)]
pub struct Session {
    pub network: Network,
    pub source: SocketAddr,
    pub destination: SocksAddr,
    /// Tag of the inbound which accepted the connection. Connections created
    /// by the core itself (probes, DNS) leave it empty.
    pub inbound_tag: String,
    /// Sniffed or reverse-mapped domain of an IP destination.
    pub domain: Option<String>,
    /// The fake address the connection was made to, before reverse mapping.
    pub origin_destination: Option<SocksAddr>,
    /// Addresses of a domain destination, filled when a rule needed them.
    pub destination_addresses: Vec<IpAddr>,
    /// Sniffed application protocol, e.g. `tls`, `http`, `quic`, `dns`.
    pub protocol: Option<String>,
    pub auth_user: Option<String>,
    pub process: Option<ProcessInfo>,
}

impl Session {
    /// Domain used by domain rules: the destination itself when it is a
    /// domain, otherwise the sniffed one.
    pub fn domain(&self) -> Option<&str> {
        self.destination.domain().or(self.domain.as_deref())
    }

    /// Destination addresses used by IP rules.
    pub fn destination_ips(&self) -> Vec<IpAddr> {
        match self.destination.ip() {
            Some(ip) => vec![ip],
            None => self.destination_addresses.clone(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.inbound_tag.is_empty()
    }
}

impl Default for Session {
    fn default() -> Self {
        Session {
            network: Network::Tcp,
            source: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            destination: SocksAddr::any(),
            inbound_tag: String::new(),
            domain: None,
            origin_destination: None,
            destination_addresses: Vec::new(),
            protocol: None,
            auth_user: None,
            process: None,
        }
    }
}
