use std::ops::Deref;

use serde_derive::Deserialize;

use crate::app::dns::DomainStrategy;

/// A field that accepts either a single value or a list of values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listable<T>(pub Vec<T>);

impl<T> Default for Listable<T> {
    fn default() -> Self {
        Listable(Vec::new())
    }
}

impl<T> Deref for Listable<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> From<Vec<T>> for Listable<T> {
    fn from(v: Vec<T>) -> Self {
        Listable(v)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<'de, T> serde::Deserialize<'de> for Listable<T>
where
    T: serde::Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(v) => Listable(vec![v]),
            OneOrMany::Many(v) => Listable(v),
        })
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub log: Log,
    pub dns: Dns,
    pub outbounds: Vec<Outbound>,
    pub route: Route,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Log {
    pub disabled: bool,
    pub level: String,
    pub output: Option<String>,
}

impl Default for Log {
    fn default() -> Self {
        Log {
            disabled: false,
            level: "info".to_string(),
            output: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Dns {
    pub servers: Vec<DnsServer>,
    pub rules: Vec<RuleConfig>,
    #[serde(rename = "final")]
    pub final_server: Option<String>,
    pub strategy: DomainStrategy,
    pub disable_cache: bool,
    pub reverse_mapping: bool,
    pub fakeip: Option<FakeIp>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DnsServer {
    pub tag: Option<String>,
    pub address: String,
    pub address_resolver: Option<String>,
    pub address_strategy: DomainStrategy,
    pub strategy: DomainStrategy,
    pub detour: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct FakeIp {
    pub enabled: bool,
    pub inet4_range: Option<String>,
    pub inet6_range: Option<String>,
}

/// An outbound declaration. Type specific settings stay as raw JSON until the
/// outbound manager knows which settings type to parse them into.
#[derive(Deserialize, Debug, Clone)]
pub struct Outbound {
    #[serde(rename = "type")]
    pub protocol: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl Outbound {
    /// Configured tag, or the declaration index when none is set.
    pub fn tag_or_index(&self, index: usize) -> String {
        match &self.tag {
            Some(tag) if !tag.is_empty() => tag.clone(),
            _ => index.to_string(),
        }
    }

    pub fn parse_settings<T>(&self) -> serde_json::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_value(serde_json::Value::Object(self.settings.clone()))
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DirectOutboundSettings {
    pub domain_strategy: DomainStrategy,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct SelectorOutboundSettings {
    pub outbounds: Vec<String>,
    pub default: Option<String>,
    pub interrupt_exist_connections: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct UrlTestOutboundSettings {
    pub outbounds: Vec<String>,
    pub url: Option<String>,
    pub interval: Option<String>,
    pub tolerance: Option<u16>,
    pub idle_timeout: Option<String>,
    pub default: Option<String>,
    pub interrupt_exist_connections: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Route {
    pub rules: Vec<RuleConfig>,
    pub rule_set: Vec<RuleSetConfig>,
    #[serde(rename = "final")]
    pub final_outbound: Option<String>,
    pub geoip: Option<GeoIp>,
    pub geosite: Option<Geosite>,
    pub default_domain_strategy: DomainStrategy,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GeoIp {
    pub path: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Geosite {
    pub path: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RuleSetConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    pub format: Option<String>,
    pub path: Option<String>,
    pub url: Option<String>,
    pub download_detour: Option<String>,
    pub update_interval: Option<String>,
    pub cache_path: Option<String>,
}

/// Rule-set source document.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RuleSetDocument {
    pub version: u8,
    pub rules: Vec<RuleConfig>,
}

/// A route, DNS or rule-set rule. Default rules populate the match fields,
/// logical rules set `type` to `logical` and nest `rules`.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RuleConfig {
    #[serde(rename = "type")]
    pub rule_type: Option<String>,
    pub mode: Option<String>,
    pub rules: Vec<RuleConfig>,

    pub inbound: Listable<String>,
    pub ip_version: Option<u8>,
    pub network: Listable<String>,
    pub auth_user: Listable<String>,
    pub protocol: Listable<String>,
    pub domain: Listable<String>,
    pub domain_suffix: Listable<String>,
    pub domain_keyword: Listable<String>,
    pub domain_regex: Listable<String>,
    pub geosite: Listable<String>,
    pub source_geoip: Listable<String>,
    pub geoip: Listable<String>,
    pub source_ip_cidr: Listable<String>,
    pub source_ip_is_private: bool,
    pub ip_cidr: Listable<String>,
    pub ip_is_private: bool,
    pub source_port: Listable<u16>,
    pub source_port_range: Listable<String>,
    pub port: Listable<u16>,
    pub port_range: Listable<String>,
    pub process_name: Listable<String>,
    pub process_path: Listable<String>,
    pub package_name: Listable<String>,
    pub user: Listable<String>,
    pub user_id: Listable<u32>,
    pub clash_mode: Option<String>,
    pub wifi_ssid: Listable<String>,
    pub wifi_bssid: Listable<String>,
    pub rule_set: Listable<String>,
    pub rule_set_ipcidr_match_source: bool,
    pub invert: bool,

    /// Target of a route rule.
    pub outbound: Option<String>,
    /// Target of a DNS rule.
    pub server: Option<String>,
}

impl RuleConfig {
    pub fn is_logical(&self) -> bool {
        self.rule_type.as_deref() == Some("logical")
    }

    /// True if this rule or any nested rule satisfies `f`.
    pub fn any(&self, f: &dyn Fn(&RuleConfig) -> bool) -> bool {
        f(self) || self.rules.iter().any(|r| r.any(f))
    }
}
