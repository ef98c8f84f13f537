use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use tracing::debug;

use super::geo::{GeoIpReader, GeositeReader};
use super::rule_set::RuleSet;
use crate::config::{Config, RuleConfig};

const DEFAULT_GEOIP_PATH: &str = "geoip.db";
const DEFAULT_GEOSITE_PATH: &str = "geosite.db";
const DEFAULT_CLASH_MODE: &str = "rule";

/// Platform network information pushed by the embedder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkState {
    pub wifi_ssid: Option<String>,
    pub wifi_bssid: Option<String>,
}

/// Shared state rules consult while matching: rule-sets, geo databases, the
/// clash mode and the network state. Route and DNS rules share one.
pub struct RuleEnv {
    rule_sets: HashMap<String, Arc<RuleSet>>,
    geoip: Option<GeoIpReader>,
    geosite: Option<GeositeReader>,
    clash_mode: RwLock<String>,
    network_state: RwLock<NetworkState>,
}

fn uses(config: &Config, f: &dyn Fn(&RuleConfig) -> bool) -> bool {
    config.route.rules.iter().any(|r| r.any(f)) || config.dns.rules.iter().any(|r| r.any(f))
}

fn needs_geoip_db(rule: &RuleConfig) -> bool {
    rule.geoip
        .iter()
        .chain(rule.source_geoip.iter())
        .any(|code| !code.eq_ignore_ascii_case("private"))
}

impl RuleEnv {
    /// Opens the geo databases only when some rule needs them.
    pub fn new(config: &Config) -> Result<Self> {
        let mut rule_sets = HashMap::new();
        for cfg in config.route.rule_set.iter() {
            let set = RuleSet::new(cfg)?;
            if rule_sets.insert(cfg.tag.clone(), Arc::new(set)).is_some() {
                return Err(anyhow!("duplicate rule-set tag: {}", cfg.tag));
            }
        }

        let geoip = if uses(config, &needs_geoip_db) {
            let path = config
                .route
                .geoip
                .as_ref()
                .and_then(|g| g.path.clone())
                .unwrap_or_else(|| DEFAULT_GEOIP_PATH.to_string());
            Some(GeoIpReader::open(path)?)
        } else {
            None
        };
        let geosite = if uses(config, &|r| !r.geosite.is_empty()) {
            let path = config
                .route
                .geosite
                .as_ref()
                .and_then(|g| g.path.clone())
                .unwrap_or_else(|| DEFAULT_GEOSITE_PATH.to_string());
            Some(GeositeReader::open(path)?)
        } else {
            None
        };
        debug!(
            "rule env: {} rule-sets, geoip {}, geosite {}",
            rule_sets.len(),
            geoip.is_some(),
            geosite.is_some()
        );

        Ok(RuleEnv {
            rule_sets,
            geoip,
            geosite,
            clash_mode: RwLock::new(DEFAULT_CLASH_MODE.to_string()),
            network_state: RwLock::new(NetworkState::default()),
        })
    }

    pub fn empty() -> Self {
        RuleEnv {
            rule_sets: HashMap::new(),
            geoip: None,
            geosite: None,
            clash_mode: RwLock::new(DEFAULT_CLASH_MODE.to_string()),
            network_state: RwLock::new(NetworkState::default()),
        }
    }

    pub fn with_rule_set(mut self, set: RuleSet) -> Self {
        self.rule_sets.insert(set.tag().to_string(), Arc::new(set));
        self
    }

    pub fn with_geosite(mut self, reader: GeositeReader) -> Self {
        self.geosite = Some(reader);
        self
    }

    pub fn rule_set(&self, tag: &str) -> Option<Arc<RuleSet>> {
        self.rule_sets.get(tag).cloned()
    }

    pub fn rule_sets(&self) -> impl Iterator<Item = &Arc<RuleSet>> {
        self.rule_sets.values()
    }

    pub fn geoip(&self) -> Option<&GeoIpReader> {
        self.geoip.as_ref()
    }

    pub fn geosite(&self) -> Option<&GeositeReader> {
        self.geosite.as_ref()
    }

    pub fn clash_mode(&self) -> String {
        self.clash_mode.read().clone()
    }

    pub fn set_clash_mode(&self, mode: &str) {
        *self.clash_mode.write() = mode.to_string();
    }

    pub fn network_state(&self) -> NetworkState {
        self.network_state.read().clone()
    }

    pub fn update_network_state(&self, state: NetworkState) {
        *self.network_state.write() = state;
    }
}
