use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde_derive::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::app::dns::{DnsClient, DomainStrategy};
use crate::app::outbound::manager::OutboundManager;
use crate::config;
use crate::option;
use crate::proxy::{outbound_chain, AnyOutboundDatagram, AnyOutboundHandler, AnyStream};
use crate::session::{Session, SocksAddr};
use crate::{Error, Result};

pub mod env;
pub mod geo;
pub mod rule;
pub mod rule_set;

pub use env::{NetworkState, RuleEnv};

use rule::{MatchContext, RuleBuilder, TargetRule};

/// Outcome of routing one connection.
pub struct RouteResult {
    /// Description of the matched rule, `None` when the final outbound was
    /// used.
    pub rule: Option<String>,
    pub tag: String,
    pub outbound: AnyOutboundHandler,
}

/// What routing a connection would do, without dialing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub matched_rule: Option<String>,
    /// The routed outbound, then every nested group selection.
    pub chain: Vec<String>,
    pub outbound: String,
}

pub struct Router {
    rules: Vec<TargetRule>,
    final_tag: String,
    domain_strategy: DomainStrategy,
    outbounds: Arc<OutboundManager>,
    dns: Arc<DnsClient>,
    env: Arc<RuleEnv>,
    cancel: CancellationToken,
}

impl Router {
    pub fn new(
        config: &config::Route,
        outbounds: Arc<OutboundManager>,
        dns: Arc<DnsClient>,
        env: Arc<RuleEnv>,
    ) -> Result<Self> {
        let builder = RuleBuilder::new(&env);
        let mut rules = Vec::with_capacity(config.rules.len());
        for (i, rule) in config.rules.iter().enumerate() {
            let target = rule.outbound.clone().unwrap_or_default();
            if outbounds.get(&target).is_none() {
                return Err(
                    anyhow!("parse route rule[{}]: outbound not found: {}", i, target).into(),
                );
            }
            let compiled = builder
                .build(rule)
                .with_context(|| format!("parse route rule[{}]", i))?;
            rules.push(TargetRule::new(compiled, target));
        }

        let final_tag = match &config.final_outbound {
            Some(tag) if !tag.is_empty() => {
                if outbounds.get(tag).is_none() {
                    return Err(anyhow!("final outbound not found: {}", tag).into());
                }
                tag.clone()
            }
            _ => outbounds
                .default_handler()
                .ok_or_else(|| anyhow!("no outbound to use as final"))?,
        };
        debug!("router: {} rules, final [{}]", rules.len(), &final_tag);

        Ok(Router {
            rules,
            final_tag,
            domain_strategy: config.default_domain_strategy,
            outbounds,
            dns,
            env,
            cancel: CancellationToken::new(),
        })
    }

    /// Loads local rule-sets and remote caches, then leaves remote downloads
    /// and refreshes to background tasks.
    pub async fn start(&self) -> Result<()> {
        let limit = Arc::new(Semaphore::new(*option::RULE_SET_FETCH_CONCURRENCY));
        for set in self.env.rule_sets() {
            let download_now = set
                .load()
                .await
                .map_err(|e| Error::RuleSet(set.tag().to_string(), format!("{:#}", e)))?;
            set.clone()
                .spawn_updates(download_now, limit.clone(), self.cancel.child_token());
        }
        Ok(())
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn final_tag(&self) -> &str {
        &self.final_tag
    }

    pub fn env(&self) -> &Arc<RuleEnv> {
        &self.env
    }

    pub fn set_clash_mode(&self, mode: &str) {
        debug!("clash mode: {}", mode);
        self.env.set_clash_mode(mode);
    }

    pub fn clash_mode(&self) -> String {
        self.env.clash_mode()
    }

    pub fn update_network_state(&self, state: NetworkState) {
        debug!("network state: {:?}", &state);
        self.env.update_network_state(state);
    }

    /// Replaces a fake destination with the domain it was allocated for.
    fn restore_fake_ip(&self, sess: &mut Session) -> Result<()> {
        let (store, ip) = match (self.dns.fakeip(), sess.destination.ip()) {
            (Some(store), Some(ip)) if store.contains(&ip) => (store, ip),
            _ => return Ok(()),
        };
        let domain = store
            .lookup(&ip)
            .ok_or_else(|| Error::Dns(format!("missing fakeip record for {}", ip)))?;
        trace!("fakeip {} -> {}", ip, &domain);
        let port = sess.destination.port();
        sess.origin_destination = Some(sess.destination.clone());
        sess.destination = SocksAddr::Domain(domain, port);
        Ok(())
    }

    fn attach_reverse_domain(&self, sess: &mut Session) {
        if sess.domain.is_some() {
            return;
        }
        if let Some(ip) = sess.destination.ip() {
            if let Some(domain) = self.dns.reverse_lookup(&ip) {
                trace!("reverse mapping {} -> {}", ip, &domain);
                sess.domain = Some(domain);
            }
        }
    }

    /// First matching rule in order, else the final outbound. A domain
    /// destination is resolved once, right before the first rule that
    /// looks at destination addresses.
    async fn match_rules(&self, sess: &mut Session) -> (Option<String>, String) {
        let mut resolved = false;
        for rule in self.rules.iter() {
            if !resolved
                && rule.needs_destination_ip()
                && sess.destination.is_domain()
                && sess.destination_addresses.is_empty()
            {
                resolved = true;
                let domain = sess.destination.host();
                match self.dns.lookup_for(sess, &domain, self.domain_strategy).await {
                    Ok(ips) => sess.destination_addresses = ips,
                    // IP rules then see no address and do not match.
                    Err(e) => warn!("resolve {} for routing failed: {}", &domain, e),
                }
            }
            if rule.matches(&MatchContext::new(sess, &self.env)) {
                return (Some(rule.to_string()), rule.target.clone());
            }
        }
        (None, self.final_tag.clone())
    }

    pub async fn route(&self, sess: &mut Session) -> Result<RouteResult> {
        self.restore_fake_ip(sess)?;
        self.attach_reverse_domain(sess);
        let (rule, tag) = self.match_rules(sess).await;
        let outbound = self
            .outbounds
            .get(&tag)
            .ok_or_else(|| Error::NoOutbound(tag.clone()))?;
        match &rule {
            Some(rule) => debug!("[{}] {} matched rule: {}", &tag, &sess.destination, rule),
            None => debug!("[{}] {} final", &tag, &sess.destination),
        }
        Ok(RouteResult {
            rule,
            tag,
            outbound,
        })
    }

    /// Routes a copy of `sess` and follows group selections, without dialing.
    pub async fn explain(&self, sess: &Session) -> Result<Diagnostic> {
        let mut sess = sess.clone();
        let result = self.route(&mut sess).await?;
        let chain = outbound_chain(&result.outbound, sess.network);
        let outbound = chain.last().cloned().unwrap_or_else(|| result.tag.clone());
        Ok(Diagnostic {
            matched_rule: result.rule,
            chain,
            outbound,
        })
    }

    pub async fn dial_tcp(&self, mut sess: Session) -> Result<AnyStream> {
        let result = self.route(&mut sess).await?;
        match result.outbound.dial_tcp(&sess).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                warn!("[{}] dial {} failed: {}", &result.tag, &sess.destination, e);
                Err(e.into())
            }
        }
    }

    pub async fn listen_packet(&self, mut sess: Session) -> Result<AnyOutboundDatagram> {
        let result = self.route(&mut sess).await?;
        Ok(result.outbound.listen_packet(&sess).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::dns::{build_transports, DnsHandle};
    use crate::app::history::HistoryStorage;
    use crate::config::{Listable, RuleConfig};
    use crate::proxy::block;

    fn router(route: config::Route, dns: config::Dns) -> Router {
        let outbounds: Vec<config::Outbound> = serde_json::from_str(
            r#"[{"type": "direct", "tag": "direct"}, {"type": "block", "tag": "block"}]"#,
        )
        .unwrap();
        let handle = Arc::new(DnsHandle::new());
        let manager = Arc::new(
            OutboundManager::new(&outbounds, handle, Arc::new(HistoryStorage::new()), Vec::new())
                .unwrap(),
        );
        let env = Arc::new(RuleEnv::empty());
        let direct = Arc::new(block::Handler::new("dns-block".to_string()));
        let graph = build_transports(&dns, |tag| manager.get(tag), direct).unwrap();
        let dns = Arc::new(DnsClient::with_graph(&dns, graph, env.clone()).unwrap());
        Router::new(&route, manager, dns, env).unwrap()
    }

    fn route_config(rules: Vec<RuleConfig>) -> config::Route {
        config::Route {
            rules,
            final_outbound: Some("direct".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let router = router(
            route_config(vec![
                RuleConfig {
                    domain_suffix: Listable(vec!["ads.com".to_string()]),
                    outbound: Some("block".to_string()),
                    ..Default::default()
                },
                RuleConfig {
                    port: Listable(vec![443]),
                    outbound: Some("direct".to_string()),
                    ..Default::default()
                },
            ]),
            config::Dns::default(),
        );
        let mut sess = Session {
            destination: SocksAddr::Domain("x.ads.com".to_string(), 443),
            ..Default::default()
        };
        let result = router.route(&mut sess).await.unwrap();
        assert_eq!(result.tag, "block");
        assert_eq!(result.rule.as_deref(), Some("domain_suffix=ads.com => block"));

        let mut sess = Session {
            destination: SocksAddr::Domain("example.org".to_string(), 80),
            ..Default::default()
        };
        let result = router.route(&mut sess).await.unwrap();
        assert_eq!(result.tag, "direct");
        assert!(result.rule.is_none());
    }

    #[tokio::test]
    async fn test_fakeip_reverse() {
        let dns: config::Dns = serde_json::from_str(
            r#"{
                "servers": [{"tag": "local", "address": "local"}, {"tag": "fake", "address": "fakeip"}],
                "fakeip": {"enabled": true}
            }"#,
        )
        .unwrap();
        let router = router(
            route_config(vec![RuleConfig {
                domain: Listable(vec!["example.com".to_string()]),
                outbound: Some("block".to_string()),
                ..Default::default()
            }]),
            dns,
        );
        let store = router.dns.fakeip().unwrap().clone();
        let ip = store.allocate("example.com", false).unwrap();
        let mut sess = Session {
            destination: SocksAddr::from((ip, 443)),
            ..Default::default()
        };
        let result = router.route(&mut sess).await.unwrap();
        assert_eq!(result.tag, "block");
        assert_eq!(sess.destination, SocksAddr::Domain("example.com".to_string(), 443));
        assert_eq!(sess.origin_destination, Some(SocksAddr::from((ip, 443))));

        // An address in the fake range nobody asked for.
        let mut sess = Session {
            destination: SocksAddr::from(("198.19.200.1", 443)),
            ..Default::default()
        };
        assert!(matches!(router.route(&mut sess).await, Err(Error::Dns(_))));
    }

    #[tokio::test]
    async fn test_explain_and_clash_mode() {
        let router = router(
            route_config(vec![RuleConfig {
                clash_mode: Some("global".to_string()),
                outbound: Some("block".to_string()),
                ..Default::default()
            }]),
            config::Dns::default(),
        );
        let sess = Session {
            destination: SocksAddr::from(("1.1.1.1", 53)),
            ..Default::default()
        };
        let diag = router.explain(&sess).await.unwrap();
        assert_eq!(diag.matched_rule, None);
        assert_eq!(diag.chain, vec!["direct".to_string()]);
        assert_eq!(diag.outbound, "direct");

        router.set_clash_mode("Global");
        let diag = router.explain(&sess).await.unwrap();
        assert_eq!(diag.outbound, "block");
        assert_eq!(diag.matched_rule.as_deref(), Some("clash_mode=global => block"));
        assert_eq!(
            serde_json::to_value(&diag).unwrap()["chain"],
            serde_json::json!(["block"])
        );
    }

    #[test]
    fn test_new_rejects_unknown_outbound() {
        let outbounds: Vec<config::Outbound> =
            serde_json::from_str(r#"[{"type": "direct", "tag": "direct"}]"#).unwrap();
        let handle = Arc::new(DnsHandle::new());
        let manager = Arc::new(
            OutboundManager::new(&outbounds, handle, Arc::new(HistoryStorage::new()), Vec::new())
                .unwrap(),
        );
        let env = Arc::new(RuleEnv::empty());
        let dns_config = config::Dns::default();
        let direct = Arc::new(block::Handler::new("dns-block".to_string()));
        let graph = build_transports(&dns_config, |tag| manager.get(tag), direct).unwrap();
        let dns = Arc::new(DnsClient::with_graph(&dns_config, graph, env.clone()).unwrap());
        let route = route_config(vec![RuleConfig {
            port: Listable(vec![80]),
            outbound: Some("proxy".to_string()),
            ..Default::default()
        }]);
        let err = Router::new(&route, manager, dns, env).err().unwrap();
        assert_eq!(err.to_string(), "parse route rule[0]: outbound not found: proxy");
    }
}
