use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use cidr::{Ipv4Cidr, Ipv4Inet, Ipv6Cidr, Ipv6Inet};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::option;

pub const DEFAULT_INET4_RANGE: &str = "198.18.0.0/15";
pub const DEFAULT_INET6_RANGE: &str = "fc00::/18";

struct State {
    next4: u32,
    next6: u128,
    by_domain: LruCache<(String, bool), IpAddr>,
    by_ip: LruCache<IpAddr, String>,
}

/// Hands out addresses from reserved ranges and remembers which domain each
/// address stands for.
pub struct FakeIpStore {
    inet4: Option<Ipv4Cidr>,
    inet6: Option<Ipv6Cidr>,
    state: Mutex<State>,
}

fn parse_inet4(s: &str) -> Result<Ipv4Cidr> {
    let cidr = Ipv4Inet::from_str(s)
        .map_err(|e| anyhow!("invalid fakeip inet4_range {}: {}", s, e))?
        .network();
    if cidr.network_length() > 30 {
        return Err(anyhow!("fakeip inet4_range too small: {}", s));
    }
    Ok(cidr)
}

fn parse_inet6(s: &str) -> Result<Ipv6Cidr> {
    let cidr = Ipv6Inet::from_str(s)
        .map_err(|e| anyhow!("invalid fakeip inet6_range {}: {}", s, e))?
        .network();
    if cidr.network_length() > 126 {
        return Err(anyhow!("fakeip inet6_range too small: {}", s));
    }
    Ok(cidr)
}

impl FakeIpStore {
    pub fn new(inet4_range: Option<&str>, inet6_range: Option<&str>) -> Result<Self> {
        Self::with_capacity(inet4_range, inet6_range, *option::FAKE_DNS_CAPACITY)
    }

    pub fn with_capacity(
        inet4_range: Option<&str>,
        inet6_range: Option<&str>,
        capacity: usize,
    ) -> Result<Self> {
        let inet4 = inet4_range.map(parse_inet4).transpose()?;
        let inet6 = inet6_range.map(parse_inet6).transpose()?;
        if inet4.is_none() && inet6.is_none() {
            return Err(anyhow!("fakeip needs at least one of inet4_range, inet6_range"));
        }
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| anyhow!("zero fakeip capacity"))?;
        Ok(FakeIpStore {
            inet4,
            inet6,
            state: Mutex::new(State {
                next4: 1,
                next6: 1,
                by_domain: LruCache::new(capacity),
                by_ip: LruCache::new(capacity),
            }),
        })
    }

    /// Returns the fake address of `domain`, allocating one if needed. `None`
    /// when no range of the requested family is configured.
    pub fn allocate(&self, domain: &str, v6: bool) -> Option<IpAddr> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let mut state = self.state.lock();
        let key = (domain.clone(), v6);
        if let Some(ip) = state.by_domain.get(&key).copied() {
            // Both maps must age together or a reissued address loses its
            // reverse record first.
            state.by_ip.promote(&ip);
            return Some(ip);
        }

        let ip = if v6 {
            let cidr = self.inet6?;
            let host_bits = 128 - cidr.network_length() as u32;
            let max = if host_bits >= 128 {
                u128::MAX
            } else {
                (1u128 << host_bits) - 1
            };
            let offset = state.next6;
            state.next6 = if offset >= max { 1 } else { offset + 1 };
            IpAddr::V6(Ipv6Addr::from(u128::from(cidr.first_address()) + offset))
        } else {
            let cidr = self.inet4?;
            let host_bits = 32 - cidr.network_length() as u32;
            // Last address is the broadcast address.
            let max = ((1u64 << host_bits) - 2) as u32;
            let offset = state.next4;
            state.next4 = if offset >= max { 1 } else { offset + 1 };
            IpAddr::V4(Ipv4Addr::from(u32::from(cidr.first_address()) + offset))
        };

        // The range wrapped around: the address now belongs to `domain`.
        if let Some(old) = state.by_ip.pop(&ip) {
            state.by_domain.pop(&(old, v6));
        }
        if let Some((_, evicted)) = state.by_domain.push(key, ip) {
            state.by_ip.pop(&evicted);
        }
        if let Some((evicted, old)) = state.by_ip.push(ip, domain.clone()) {
            state.by_domain.pop(&(old, evicted.is_ipv6()));
        }
        trace!("fakeip {} -> {}", &domain, ip);
        Some(ip)
    }

    pub fn lookup(&self, ip: &IpAddr) -> Option<String> {
        let mut state = self.state.lock();
        let domain = state.by_ip.get(ip).cloned()?;
        state.by_domain.promote(&(domain.clone(), ip.is_ipv6()));
        Some(domain)
    }

    /// Whether `ip` lies inside one of the fake ranges, mapped or not.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => self.inet4.map(|c| c.contains(ip)).unwrap_or(false),
            IpAddr::V6(ip) => self.inet6.map(|c| c.contains(ip)).unwrap_or(false),
        }
    }
}
