use std::collections::{hash_map, HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, trace};

use crate::app::dns::{DomainStrategy, SyncDnsClient};
use crate::app::history::{HistoryStorage, ProbeResult};
use crate::config::{
    DirectOutboundSettings, Outbound, SelectorOutboundSettings, UrlTestOutboundSettings,
};
use crate::proxy::{block, direct, select, urltest, AnyOutboundHandler};

const DEFAULT_DIRECT_TAG: &str = "direct";

#[derive(Clone)]
pub struct OutBoundHandlerInfo {
    handler: AnyOutboundHandler,
    protocol: String,
    sub_handlers: Arc<Vec<String>>,
    tag: String,
}

impl OutBoundHandlerInfo {
    pub fn new(
        tag: String,
        handler: AnyOutboundHandler,
        protocol: String,
        sub_handlers: Vec<String>,
    ) -> Self {
        Self {
            tag,
            handler,
            protocol,
            sub_handlers: Arc::new(sub_handlers),
        }
    }

    pub fn handler(&self) -> &AnyOutboundHandler {
        &self.handler
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn sub_handlers(&self) -> &Vec<String> {
        &self.sub_handlers
    }
}

impl Deref for OutBoundHandlerInfo {
    type Target = AnyOutboundHandler;
    fn deref(&self) -> &Self::Target {
        &self.handler
    }
}

enum GroupSettings {
    Selector(SelectorOutboundSettings),
    UrlTest(UrlTestOutboundSettings),
}

impl GroupSettings {
    fn members(&self) -> &[String] {
        match self {
            GroupSettings::Selector(s) => &s.outbounds,
            GroupSettings::UrlTest(s) => &s.outbounds,
        }
    }
}

struct PendingGroup<'a> {
    tag: String,
    protocol: &'a str,
    settings: GroupSettings,
}

pub struct OutboundManager {
    handlers: HashMap<String, OutBoundHandlerInfo>,
    selectors: HashMap<String, Arc<select::Handler>>,
    default_handler: Option<String>,
    history: Arc<HistoryStorage>,
}

impl OutboundManager {
    /// Builds every configured outbound. `external` outbounds come from the
    /// embedder and can be referenced like configured ones.
    pub fn new(
        outbounds: &[Outbound],
        dns_client: SyncDnsClient,
        history: Arc<HistoryStorage>,
        external: Vec<AnyOutboundHandler>,
    ) -> Result<Self> {
        let mut manager = OutboundManager {
            handlers: HashMap::new(),
            selectors: HashMap::new(),
            default_handler: None,
            history,
        };

        let mut declared = HashSet::new();
        for (i, outbound) in outbounds.iter().enumerate() {
            let tag = outbound.tag_or_index(i);
            if !declared.insert(tag.clone()) {
                return Err(anyhow!("duplicate outbound tag: {}", tag));
            }
            if manager.default_handler.is_none() {
                debug!("default handler [{}]", &tag);
                manager.default_handler.replace(tag);
            }
        }
        for handler in external {
            let tag = handler.tag().to_string();
            if !declared.insert(tag.clone()) {
                return Err(anyhow!("duplicate outbound tag: {}", tag));
            }
            manager.add(tag, handler, "external".to_string(), Vec::new());
        }

        let groups = manager.load_handlers(outbounds, &dns_client)?;
        if declared.insert(DEFAULT_DIRECT_TAG.to_string()) {
            trace!("add implicit [{}] outbound", DEFAULT_DIRECT_TAG);
            manager.add(
                DEFAULT_DIRECT_TAG.to_string(),
                Arc::new(direct::Handler::new(
                    DEFAULT_DIRECT_TAG.to_string(),
                    dns_client,
                    DomainStrategy::AsIs,
                )),
                "direct".to_string(),
                Vec::new(),
            );
        }
        for group in groups.iter() {
            for member in group.settings.members() {
                if !declared.contains(member) {
                    return Err(anyhow!(
                        "outbound [{}]: member not found: {}",
                        &group.tag,
                        member
                    ));
                }
            }
        }
        manager.load_groups(groups)?;

        if manager.default_handler.is_none() {
            manager.default_handler = Some(DEFAULT_DIRECT_TAG.to_string());
        }
        Ok(manager)
    }

    /// Builds leaf outbounds and returns the groups, which need their members
    /// built first.
    fn load_handlers<'a>(
        &mut self,
        outbounds: &'a [Outbound],
        dns_client: &SyncDnsClient,
    ) -> Result<Vec<PendingGroup<'a>>> {
        let mut groups = Vec::new();
        for (i, outbound) in outbounds.iter().enumerate() {
            let tag = outbound.tag_or_index(i);
            let invalid =
                |e: serde_json::Error| anyhow!("invalid [{}] outbound settings: {}", &tag, e);
            let h: AnyOutboundHandler = match outbound.protocol.as_str() {
                "direct" => {
                    let settings: DirectOutboundSettings =
                        outbound.parse_settings().map_err(invalid)?;
                    Arc::new(direct::Handler::new(
                        tag.clone(),
                        dns_client.clone(),
                        settings.domain_strategy,
                    ))
                }
                "block" => Arc::new(block::Handler::new(tag.clone())),
                "selector" => {
                    let settings = outbound.parse_settings().map_err(invalid)?;
                    groups.push(PendingGroup {
                        tag,
                        protocol: &outbound.protocol,
                        settings: GroupSettings::Selector(settings),
                    });
                    continue;
                }
                "urltest" => {
                    let settings = outbound.parse_settings().map_err(invalid)?;
                    groups.push(PendingGroup {
                        tag,
                        protocol: &outbound.protocol,
                        settings: GroupSettings::UrlTest(settings),
                    });
                    continue;
                }
                protocol => {
                    return Err(anyhow!(
                        "unknown protocol [{}] of outbound [{}]",
                        protocol,
                        &tag
                    ))
                }
            };
            trace!("added handler [{}]", &tag);
            self.add(tag, h, outbound.protocol.clone(), Vec::new());
        }
        Ok(groups)
    }

    /// Builds groups whose members are all available, pass after pass. A
    /// pass without progress means the remaining groups reference each other.
    fn load_groups(&mut self, mut pending: Vec<PendingGroup<'_>>) -> Result<()> {
        while !pending.is_empty() {
            let before = pending.len();
            let mut rest = Vec::new();
            for group in pending {
                let actors: Option<Vec<AnyOutboundHandler>> = group
                    .settings
                    .members()
                    .iter()
                    .map(|m| self.get(m))
                    .collect();
                let actors = match actors {
                    Some(actors) => actors,
                    None => {
                        rest.push(group);
                        continue;
                    }
                };
                self.load_group(group, actors)?;
            }
            if rest.len() == before {
                let tags = rest
                    .iter()
                    .map(|g| g.tag.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(anyhow!("circular outbound reference: {}", tags));
            }
            pending = rest;
        }
        Ok(())
    }

    fn load_group(
        &mut self,
        group: PendingGroup<'_>,
        actors: Vec<AnyOutboundHandler>,
    ) -> Result<()> {
        let tag = group.tag;
        let members = group.settings.members().to_vec();
        let invalid = |e: anyhow::Error| anyhow!("invalid [{}] outbound settings: {}", &tag, e);
        let handler: AnyOutboundHandler = match &group.settings {
            GroupSettings::Selector(settings) => {
                let h = Arc::new(
                    select::Handler::new(
                        tag.clone(),
                        actors,
                        settings.default.as_deref(),
                        settings.interrupt_exist_connections,
                    )
                    .map_err(invalid)?,
                );
                self.selectors.insert(tag.clone(), h.clone());
                h
            }
            GroupSettings::UrlTest(settings) => Arc::new(
                urltest::Handler::new(tag.clone(), actors, settings, self.history.clone())
                    .map_err(invalid)?,
            ),
        };
        trace!(
            "added handler [{}] with actors: {}",
            &tag,
            members.join(",")
        );
        self.add(tag, handler, group.protocol.to_string(), members);
        Ok(())
    }

    pub fn add(
        &mut self,
        tag: String,
        handler: AnyOutboundHandler,
        protocol: String,
        sub_handlers: Vec<String>,
    ) {
        self.handlers.insert(
            tag.clone(),
            OutBoundHandlerInfo::new(tag, handler, protocol, sub_handlers),
        );
    }

    pub fn get(&self, tag: &str) -> Option<AnyOutboundHandler> {
        self.handlers.get(tag).map(|x| x.handler.clone())
    }

    pub fn get_outbound_info(&self, tag: &str) -> Option<OutBoundHandlerInfo> {
        self.handlers.get(tag).cloned()
    }

    pub fn default_handler(&self) -> Option<String> {
        self.default_handler.clone()
    }

    pub fn handlers(&self) -> Handlers {
        Handlers {
            inner: self.handlers.values(),
        }
    }

    pub fn history(&self) -> &Arc<HistoryStorage> {
        &self.history
    }

    pub fn get_selector(&self, tag: &str) -> Option<Arc<select::Handler>> {
        self.selectors.get(tag).cloned()
    }

    /// Probes the members of group `tag` now.
    pub async fn url_test(&self, tag: &str) -> crate::Result<HashMap<String, ProbeResult>> {
        let handler = self
            .get(tag)
            .ok_or_else(|| crate::Error::NoOutbound(tag.to_string()))?;
        let group = handler
            .as_group()
            .ok_or_else(|| crate::Error::Config(anyhow!("outbound [{}] is not a group", tag)))?;
        Ok(group.url_test().await?)
    }

    pub fn start(&self) {
        for h in self.handlers() {
            if let Some(group) = h.as_group() {
                trace!("starting group [{}]", h.tag());
                group.post_start();
            }
        }
    }

    pub fn close(&self) {
        for h in self.handlers() {
            if let Some(group) = h.as_group() {
                group.close();
            }
        }
    }
}

pub struct Handlers<'a> {
    inner: hash_map::Values<'a, String, OutBoundHandlerInfo>,
}

impl<'a> Iterator for Handlers<'a> {
    type Item = &'a OutBoundHandlerInfo;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
