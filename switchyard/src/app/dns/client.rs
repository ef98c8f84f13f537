use std::io;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};
use trust_dns_proto::op::Message;
use trust_dns_proto::rr::RecordType;

use super::transport::{merge_results, record_types};
use super::{
    build_transports, query_raw, DnsTransport, DomainStrategy, FakeIpStore, SyncDnsClient,
    TransportGraph,
};
use crate::app::outbound::manager::OutboundManager;
use crate::app::router::rule::{MatchContext, RuleBuilder, TargetRule};
use crate::app::router::RuleEnv;
use crate::config;
use crate::option;
use crate::proxy::{direct, AnyOutboundHandler};
use crate::session::{Network, Session, SocksAddr};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    transport: String,
    domain: String,
    record_type: RecordType,
}

struct CacheEntry {
    ips: Vec<IpAddr>,
    expires: Instant,
}

/// Resolver front end: picks a transport by DNS rules, caches answers and
/// keeps the reverse mapping.
pub struct DnsClient {
    graph: TransportGraph,
    rules: Vec<TargetRule>,
    env: Arc<RuleEnv>,
    strategy: DomainStrategy,
    cache: Option<Mutex<LruCache<CacheKey, CacheEntry>>>,
    reverse: Option<Mutex<LruCache<IpAddr, String>>>,
}

fn lru<K: std::hash::Hash + Eq, V>(size: usize) -> Result<Mutex<LruCache<K, V>>> {
    let size = NonZeroUsize::new(size).ok_or_else(|| anyhow!("zero dns cache size"))?;
    Ok(Mutex::new(LruCache::new(size)))
}

impl DnsClient {
    pub fn new(
        config: &config::Dns,
        outbounds: &OutboundManager,
        env: Arc<RuleEnv>,
        dns_handle: SyncDnsClient,
    ) -> Result<Self> {
        let direct: AnyOutboundHandler = Arc::new(direct::Handler::new(
            "dns-direct".to_string(),
            dns_handle,
            DomainStrategy::AsIs,
        ));
        let graph = build_transports(config, |tag| outbounds.get(tag), direct)?;
        Self::with_graph(config, graph, env)
    }

    pub fn with_graph(
        config: &config::Dns,
        graph: TransportGraph,
        env: Arc<RuleEnv>,
    ) -> Result<Self> {
        let builder = RuleBuilder::new(&env);
        let mut rules = Vec::with_capacity(config.rules.len());
        for (i, rule) in config.rules.iter().enumerate() {
            let server = rule.server.clone().unwrap_or_default();
            if graph.get(&server).is_none() {
                return Err(anyhow!("parse dns rule[{}]: dns server not found: {}", i, server));
            }
            let compiled = builder
                .build(rule)
                .with_context(|| format!("parse dns rule[{}]", i))?;
            rules.push(TargetRule::new(compiled, server));
        }

        let cache = if config.disable_cache {
            None
        } else {
            Some(lru(*option::DNS_CACHE_SIZE)?)
        };
        let reverse = if config.reverse_mapping {
            Some(lru(*option::DNS_REVERSE_MAPPING_SIZE)?)
        } else {
            None
        };

        Ok(DnsClient {
            graph,
            rules,
            env,
            strategy: config.strategy,
            cache,
            reverse,
        })
    }

    pub fn fakeip(&self) -> Option<&Arc<FakeIpStore>> {
        self.graph.fakeip.as_ref()
    }

    pub fn transport(&self, tag: &str) -> Option<Arc<dyn DnsTransport>> {
        self.graph.get(tag)
    }

    pub fn default_transport(&self) -> &Arc<dyn DnsTransport> {
        &self.graph.default
    }

    /// Picks the transport for a query. Rules targeting a fake-ip transport
    /// are skipped unless `fake_allowed`.
    fn match_transport(&self, sess: &Session, fake_allowed: bool) -> Arc<dyn DnsTransport> {
        let ctx = MatchContext::new(sess, &self.env);
        for rule in self.rules.iter() {
            let transport = match self.graph.get(&rule.target) {
                Some(t) => t,
                None => continue,
            };
            if transport.is_fakeip() && !fake_allowed {
                continue;
            }
            if rule.matches(&ctx) {
                debug!("dns [{}] matched rule: {}", transport.name(), &rule);
                return transport;
            }
        }
        self.graph.default.clone()
    }

    fn query_session(domain: &str) -> Session {
        Session {
            network: Network::Udp,
            destination: SocksAddr::Domain(domain.to_string(), 53),
            ..Default::default()
        }
    }

    pub async fn lookup(&self, domain: &str, strategy: DomainStrategy) -> io::Result<Vec<IpAddr>> {
        let sess = Self::query_session(domain);
        self.lookup_for(&sess, domain, strategy).await
    }

    /// Resolves `domain` on behalf of the connection described by `sess`, so
    /// DNS rules can match on its inbound, source and so on.
    pub async fn lookup_for(
        &self,
        sess: &Session,
        domain: &str,
        strategy: DomainStrategy,
    ) -> io::Result<Vec<IpAddr>> {
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let mut query_sess = sess.clone();
        query_sess.destination = SocksAddr::Domain(domain.clone(), sess.destination.port());

        // Fake answers are only for DNS clients, never for the core itself.
        let transport = self.match_transport(&query_sess, false);
        let strategy = strategy.or(transport.strategy()).or(self.strategy);
        let results = join_all(
            record_types(strategy)
                .into_iter()
                .map(|t| self.query_cached(transport.as_ref(), &domain, t)),
        )
        .await;
        let ips = merge_results(&domain, strategy, results)?;
        trace!("[{}] lookup {} -> {:?}", transport.name(), &domain, &ips);

        if let Some(reverse) = &self.reverse {
            let mut reverse = reverse.lock();
            for ip in ips.iter() {
                reverse.put(*ip, domain.clone());
            }
        }
        Ok(ips)
    }

    async fn query_cached(
        &self,
        transport: &dyn DnsTransport,
        domain: &str,
        record_type: RecordType,
    ) -> io::Result<Vec<IpAddr>> {
        let cache = match &self.cache {
            Some(cache) if !transport.is_fakeip() => cache,
            _ => return query_raw(transport, domain, record_type).await.map(|(ips, _)| ips),
        };
        let key = CacheKey {
            transport: transport.name().to_string(),
            domain: domain.to_string(),
            record_type,
        };
        {
            let mut cache = cache.lock();
            let fresh = cache
                .get(&key)
                .filter(|e| e.expires > Instant::now())
                .map(|e| e.ips.clone());
            if let Some(ips) = fresh {
                trace!("dns cache hit {} {}", domain, record_type);
                return Ok(ips);
            }
            cache.pop(&key);
        }
        let (ips, ttl) = query_raw(transport, domain, record_type).await?;
        if !ips.is_empty() && ttl > 0 {
            cache.lock().put(
                key,
                CacheEntry {
                    ips: ips.clone(),
                    expires: Instant::now() + Duration::from_secs(ttl as u64),
                },
            );
        }
        Ok(ips)
    }

    /// Forwards a raw query, choosing the transport by DNS rules.
    pub async fn exchange(&self, sess: &Session, request: &Message) -> io::Result<Message> {
        let query = request
            .queries()
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty dns question"))?;
        let domain = query.name().to_ascii();
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let address_query = matches!(query.query_type(), RecordType::A | RecordType::AAAA);
        let mut query_sess = sess.clone();
        query_sess.destination = SocksAddr::Domain(domain, sess.destination.port());
        let transport = self.match_transport(&query_sess, address_query);
        transport.exchange(request).await
    }

    /// Domain a previous lookup resolved to `ip`, if reverse mapping is on.
    pub fn reverse_lookup(&self, ip: &IpAddr) -> Option<String> {
        self.reverse.as_ref().and_then(|r| r.lock().get(ip).cloned())
    }

    pub fn close(&self) {
        self.graph.close();
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }
}
