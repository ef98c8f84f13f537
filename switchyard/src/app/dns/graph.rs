use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, trace};
use trust_dns_proto::op::ResponseCode;

use super::fakeip::{DEFAULT_INET4_RANGE, DEFAULT_INET6_RANGE};
use super::transport::{
    rcode_from_str, FakeIpTransport, LocalTransport, RcodeTransport, TcpTransport, UdpTransport,
};
use super::{DnsTransport, FakeIpStore, TransportDialer};
use crate::config;
use crate::proxy::AnyOutboundHandler;
use crate::session::SocksAddr;

/// The built DNS transports.
pub struct TransportGraph {
    pub transports: HashMap<String, Arc<dyn DnsTransport>>,
    pub default: Arc<dyn DnsTransport>,
    pub fakeip: Option<Arc<FakeIpStore>>,
}

impl TransportGraph {
    pub fn get(&self, tag: &str) -> Option<Arc<dyn DnsTransport>> {
        self.transports.get(tag).cloned()
    }

    pub fn close(&self) {
        for t in self.transports.values() {
            t.close();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ServerAddress {
    Local,
    FakeIp,
    Rcode(ResponseCode),
    Udp(SocksAddr),
    Tcp(SocksAddr),
}

impl ServerAddress {
    /// Whether the server host is a name that has to be resolved before the
    /// transport can dial it.
    fn needs_resolver(&self) -> bool {
        match self {
            ServerAddress::Udp(addr) | ServerAddress::Tcp(addr) => {
                addr.domain().map(|d| d.contains('.')).unwrap_or(false)
            }
            _ => false,
        }
    }
}

fn parse_host_port(s: &str, default_port: u16) -> Result<SocksAddr> {
    let s = s.split('/').next().unwrap_or("");
    if s.is_empty() {
        return Err(anyhow!("missing server host"));
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr.into());
    }
    if let Ok(ip) = s.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return Ok((ip, default_port).into());
    }
    match s.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|e| anyhow!("invalid server port {}: {}", port, e))?;
            Ok(SocksAddr::from((host, port)))
        }
        None => Ok(SocksAddr::from((s, default_port))),
    }
}

fn parse_address(address: &str) -> Result<ServerAddress> {
    match address {
        "local" => return Ok(ServerAddress::Local),
        "fakeip" => return Ok(ServerAddress::FakeIp),
        _ => (),
    }
    match address.split_once("://") {
        None => Ok(ServerAddress::Udp(parse_host_port(address, 53)?)),
        Some(("udp", rest)) => Ok(ServerAddress::Udp(parse_host_port(rest, 53)?)),
        Some(("tcp", rest)) => Ok(ServerAddress::Tcp(parse_host_port(rest, 53)?)),
        Some(("rcode", code)) => rcode_from_str(code)
            .map(ServerAddress::Rcode)
            .ok_or_else(|| anyhow!("unknown rcode: {}", code)),
        Some(_) => Err(anyhow!("unsupported DNS server address: {}", address)),
    }
}

fn server_tag(index: usize, server: &config::DnsServer) -> String {
    match &server.tag {
        Some(tag) if !tag.is_empty() => tag.clone(),
        _ => index.to_string(),
    }
}

/// Builds every declared transport.
///
/// A server can only be built once the transport named by its
/// `address_resolver` exists, so the declarations are walked repeatedly until
/// a pass adds nothing. Whatever is left at that point references itself
/// through a chain of resolvers.
pub fn build<F>(
    config: &config::Dns,
    find_outbound: F,
    direct: AnyOutboundHandler,
) -> Result<TransportGraph>
where
    F: Fn(&str) -> Option<AnyOutboundHandler>,
{
    let fakeip = match &config.fakeip {
        Some(f) if f.enabled => {
            let inet4 = f.inet4_range.as_deref().unwrap_or(DEFAULT_INET4_RANGE);
            let inet6 = f.inet6_range.as_deref().unwrap_or(DEFAULT_INET6_RANGE);
            Some(Arc::new(FakeIpStore::new(Some(inet4), Some(inet6))?))
        }
        _ => None,
    };

    let tags: Vec<String> = config
        .servers
        .iter()
        .enumerate()
        .map(|(i, s)| server_tag(i, s))
        .collect();
    let mut declared: HashSet<&str> = HashSet::new();
    for tag in tags.iter() {
        if !declared.insert(tag.as_str()) {
            return Err(anyhow!("duplicate dns server tag: {}", tag));
        }
    }

    let mut transports: HashMap<String, Arc<dyn DnsTransport>> = HashMap::new();
    loop {
        let last_len = transports.len();
        for (server, tag) in config.servers.iter().zip(tags.iter()) {
            if transports.contains_key(tag) {
                continue;
            }
            let address = parse_address(&server.address)
                .map_err(|e| anyhow!("parse dns server[{}]: {}", tag, e))?;

            let resolver = match server.address_resolver.as_deref() {
                Some(resolver_tag) if !resolver_tag.is_empty() => {
                    if !declared.contains(resolver_tag) {
                        return Err(anyhow!(
                            "parse dns server[{}]: address resolver not found: {}",
                            tag,
                            resolver_tag
                        ));
                    }
                    match transports.get(resolver_tag) {
                        Some(t) => Some((t.clone(), server.address_strategy)),
                        // Not built yet, retry on the next pass.
                        None => continue,
                    }
                }
                _ => {
                    if address.needs_resolver() {
                        return Err(anyhow!("parse dns server[{}]: missing address_resolver", tag));
                    }
                    None
                }
            };

            let detour = match server.detour.as_deref() {
                Some(d) if !d.is_empty() => find_outbound(d).ok_or_else(|| {
                    anyhow!("parse dns server[{}]: detour outbound not found: {}", tag, d)
                })?,
                _ => direct.clone(),
            };

            let transport: Arc<dyn DnsTransport> = match address {
                ServerAddress::Local => Arc::new(LocalTransport {
                    name: tag.clone(),
                    strategy: server.strategy,
                }),
                ServerAddress::FakeIp => {
                    let store = fakeip.clone().ok_or_else(|| {
                        anyhow!("parse dns server[{}]: fakeip is not enabled", tag)
                    })?;
                    Arc::new(FakeIpTransport {
                        name: tag.clone(),
                        store,
                    })
                }
                ServerAddress::Rcode(code) => Arc::new(RcodeTransport {
                    name: tag.clone(),
                    code,
                }),
                ServerAddress::Udp(addr) => Arc::new(UdpTransport {
                    name: tag.clone(),
                    server: addr,
                    strategy: server.strategy,
                    dialer: TransportDialer::new(detour, resolver),
                }),
                ServerAddress::Tcp(addr) => Arc::new(TcpTransport {
                    name: tag.clone(),
                    server: addr,
                    strategy: server.strategy,
                    dialer: TransportDialer::new(detour, resolver),
                }),
            };
            trace!("added dns transport [{}]", tag);
            transports.insert(tag.clone(), transport);
        }
        if transports.len() == config.servers.len() {
            break;
        }
        if transports.len() == last_len {
            let stuck: Vec<&str> = tags
                .iter()
                .filter(|t| !transports.contains_key(*t))
                .map(String::as_str)
                .collect();
            return Err(anyhow!(
                "found circular reference in dns servers: {}",
                stuck.join(" ")
            ));
        }
    }

    let default = match config.final_server.as_deref() {
        Some(tag) if !tag.is_empty() => transports
            .get(tag)
            .cloned()
            .ok_or_else(|| anyhow!("default dns server not found: {}", tag))?,
        _ => match tags.first() {
            Some(first) => transports
                .get(first)
                .cloned()
                .ok_or_else(|| anyhow!("default dns server not found: {}", first))?,
            None => {
                let local: Arc<dyn DnsTransport> = Arc::new(LocalTransport {
                    name: "local".to_string(),
                    strategy: config.strategy,
                });
                transports.insert("local".to_string(), local.clone());
                local
            }
        },
    };
    if default.is_fakeip() {
        return Err(anyhow!("default DNS server cannot be fakeip"));
    }
    debug!("default dns server [{}]", default.name());

    Ok(TransportGraph {
        transports,
        default,
        fakeip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::block;

    fn server(tag: &str, address: &str, resolver: Option<&str>) -> config::DnsServer {
        config::DnsServer {
            tag: Some(tag.to_string()),
            address: address.to_string(),
            address_resolver: resolver.map(str::to_string),
            ..Default::default()
        }
    }

    fn build_servers(servers: Vec<config::DnsServer>) -> Result<TransportGraph> {
        let config = config::Dns {
            servers,
            ..Default::default()
        };
        let direct: AnyOutboundHandler = Arc::new(block::Handler::new("direct".to_string()));
        build(&config, |_| None, direct)
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("local").unwrap(), ServerAddress::Local);
        assert_eq!(
            parse_address("8.8.8.8").unwrap(),
            ServerAddress::Udp("8.8.8.8:53".parse().unwrap())
        );
        assert_eq!(
            parse_address("tcp://[2001:4860:4860::8888]:5353").unwrap(),
            ServerAddress::Tcp("[2001:4860:4860::8888]:5353".parse().unwrap())
        );
        assert_eq!(
            parse_address("udp://dns.google").unwrap(),
            ServerAddress::Udp(SocksAddr::Domain("dns.google".to_string(), 53))
        );
        assert_eq!(
            parse_address("rcode://refused").unwrap(),
            ServerAddress::Rcode(ResponseCode::Refused)
        );
        assert!(parse_address("https://1.1.1.1/dns-query").is_err());
        assert!(parse_address("rcode://maybe").is_err());
    }

    #[test]
    fn test_resolver_chain_out_of_order() {
        let graph = build_servers(vec![
            server("remote", "tcp://dns.google", Some("bootstrap")),
            server("bootstrap", "8.8.8.8", None),
        ])
        .unwrap();
        assert!(graph.get("remote").is_some());
        assert!(graph.get("bootstrap").is_some());
        assert_eq!(graph.default.name(), "remote");
    }

    #[test]
    fn test_circular_reference() {
        let err = build_servers(vec![
            server("a", "udp://a.example", Some("b")),
            server("b", "udp://b.example", Some("a")),
            server("c", "1.1.1.1", None),
        ])
        .err()
        .unwrap()
        .to_string();
        assert_eq!(err, "found circular reference in dns servers: a b");

        let err = build_servers(vec![server("self", "udp://self.example", Some("self"))])
            .err()
            .unwrap()
            .to_string();
        assert!(err.contains("circular reference in dns servers: self"), "{}", err);
    }

    #[test]
    fn test_missing_address_resolver() {
        let err = build_servers(vec![server("google", "tcp://dns.google", None)])
            .err()
            .unwrap()
            .to_string();
        assert_eq!(err, "parse dns server[google]: missing address_resolver");

        let err = build_servers(vec![server("google", "dns.google", Some("nope"))])
            .err()
            .unwrap()
            .to_string();
        assert_eq!(err, "parse dns server[google]: address resolver not found: nope");
    }

    #[test]
    fn test_default_server() {
        let graph = build_servers(vec![]).unwrap();
        assert_eq!(graph.default.name(), "local");

        let config = config::Dns {
            servers: vec![server("fake", "fakeip", None), server("local", "local", None)],
            final_server: Some("fake".to_string()),
            fakeip: Some(config::FakeIp {
                enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let direct: AnyOutboundHandler = Arc::new(block::Handler::new("direct".to_string()));
        let err = build(&config, |_| None, direct.clone()).err().unwrap().to_string();
        assert_eq!(err, "default DNS server cannot be fakeip");

        let config = config::Dns {
            final_server: Some("local".to_string()),
            ..config
        };
        let graph = build(&config, |_| None, direct).unwrap();
        assert_eq!(graph.default.name(), "local");
        assert!(graph.fakeip.is_some());
    }

    #[test]
    fn test_duplicate_tag() {
        let err = build_servers(vec![
            server("a", "1.1.1.1", None),
            server("b", "8.8.8.8", None),
            server("a", "9.9.9.9", None),
        ])
        .err()
        .unwrap()
        .to_string();
        assert_eq!(err, "duplicate dns server tag: a");
    }

    #[test]
    fn test_fakeip_requires_enabled() {
        let err = build_servers(vec![server("local", "local", None), server("fake", "fakeip", None)])
            .err()
            .unwrap()
            .to_string();
        assert_eq!(err, "parse dns server[fake]: fakeip is not enabled");
    }
}
