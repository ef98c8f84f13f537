use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;
use serde_derive::Deserialize;
use tracing::trace;

mod client;
mod dialer;
mod fakeip;
mod graph;
mod transport;

pub use client::DnsClient;
pub use dialer::TransportDialer;
pub use fakeip::FakeIpStore;
pub use graph::{build as build_transports, TransportGraph};
pub use transport::{answer_ips, lookup_raw, new_query, query_raw, DnsTransport};

/// How a domain is turned into addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum DomainStrategy {
    #[default]
    AsIs,
    PreferIpv4,
    PreferIpv6,
    Ipv4Only,
    Ipv6Only,
}

impl DomainStrategy {
    pub fn wants_ipv4(&self) -> bool {
        !matches!(self, DomainStrategy::Ipv6Only)
    }

    pub fn wants_ipv6(&self) -> bool {
        !matches!(self, DomainStrategy::Ipv4Only)
    }

    /// Orders and filters `ips` according to the strategy.
    pub fn sort(&self, mut ips: Vec<IpAddr>) -> Vec<IpAddr> {
        match self {
            DomainStrategy::AsIs => (),
            DomainStrategy::PreferIpv4 => ips.sort_by_key(|ip| ip.is_ipv6()),
            DomainStrategy::PreferIpv6 => ips.sort_by_key(|ip| ip.is_ipv4()),
            DomainStrategy::Ipv4Only => ips.retain(|ip| ip.is_ipv4()),
            DomainStrategy::Ipv6Only => ips.retain(|ip| ip.is_ipv6()),
        }
        ips
    }

    /// `self` unless it is `AsIs`, in which case `fallback`.
    pub fn or(self, fallback: DomainStrategy) -> DomainStrategy {
        if self == DomainStrategy::AsIs {
            fallback
        } else {
            self
        }
    }
}

impl TryFrom<String> for DomainStrategy {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "" | "as_is" => Ok(DomainStrategy::AsIs),
            "prefer_ipv4" => Ok(DomainStrategy::PreferIpv4),
            "prefer_ipv6" => Ok(DomainStrategy::PreferIpv6),
            "ipv4_only" => Ok(DomainStrategy::Ipv4Only),
            "ipv6_only" => Ok(DomainStrategy::Ipv6Only),
            _ => Err(anyhow!("unknown domain strategy: {}", s)),
        }
    }
}

impl fmt::Display for DomainStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DomainStrategy::AsIs => "as_is",
            DomainStrategy::PreferIpv4 => "prefer_ipv4",
            DomainStrategy::PreferIpv6 => "prefer_ipv6",
            DomainStrategy::Ipv4Only => "ipv4_only",
            DomainStrategy::Ipv6Only => "ipv6_only",
        };
        f.write_str(s)
    }
}

/// Late-bound access to the DNS client.
///
/// Outbounds are built before the DNS transports that may dial through them,
/// so they hold this handle and the client is installed once it exists.
/// Until then lookups go to the system resolver.
#[derive(Default)]
pub struct DnsHandle {
    client: RwLock<Option<Arc<DnsClient>>>,
}

pub type SyncDnsClient = Arc<DnsHandle>;

impl DnsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, client: Arc<DnsClient>) {
        self.client.write().replace(client);
    }

    pub fn uninstall(&self) {
        self.client.write().take();
    }

    pub async fn lookup(&self, domain: &str, strategy: DomainStrategy) -> io::Result<Vec<IpAddr>> {
        let client = self.client.read().clone();
        match client {
            Some(client) => client.lookup(domain, strategy).await,
            None => {
                trace!("dns client not installed, system lookup {}", domain);
                system_lookup(domain, strategy).await
            }
        }
    }
}

pub(crate) async fn system_lookup(domain: &str, strategy: DomainStrategy) -> io::Result<Vec<IpAddr>> {
    let ips: Vec<IpAddr> = tokio::net::lookup_host((domain, 0))
        .await?
        .map(|addr| addr.ip())
        .collect();
    let ips = strategy.sort(ips);
    if ips.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no record for {}", domain),
        ));
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_sort() {
        let v4: IpAddr = "1.1.1.1".parse().unwrap();
        let v6: IpAddr = "2606:4700::1111".parse().unwrap();
        assert_eq!(DomainStrategy::PreferIpv4.sort(vec![v6, v4]), vec![v4, v6]);
        assert_eq!(DomainStrategy::PreferIpv6.sort(vec![v4, v6]), vec![v6, v4]);
        assert_eq!(DomainStrategy::Ipv4Only.sort(vec![v6, v4]), vec![v4]);
        assert_eq!(DomainStrategy::AsIs.sort(vec![v6, v4]), vec![v6, v4]);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            DomainStrategy::try_from("ipv6_only".to_string()).unwrap(),
            DomainStrategy::Ipv6Only
        );
        assert_eq!(
            DomainStrategy::try_from(String::new()).unwrap(),
            DomainStrategy::AsIs
        );
        assert!(DomainStrategy::try_from("ipv5".to_string()).is_err());
    }
}
