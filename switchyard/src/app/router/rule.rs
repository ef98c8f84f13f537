use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use cidr::{IpCidr, IpInet};
use regex::Regex;

use super::geo::GeositeItemKind;
use super::rule_set::RuleSet;
use super::RuleEnv;
use crate::config::RuleConfig;
use crate::session::{Network, Session};

/// What a rule is evaluated against.
pub struct MatchContext<'a> {
    pub sess: &'a Session,
    pub env: &'a RuleEnv,
    /// Set while evaluating a rule-set referenced with
    /// `rule_set_ipcidr_match_source`.
    pub ip_cidr_match_source: bool,
}

impl<'a> MatchContext<'a> {
    pub fn new(sess: &'a Session, env: &'a RuleEnv) -> Self {
        MatchContext {
            sess,
            env,
            ip_cidr_match_source: false,
        }
    }

    fn any_destination_ip<F: Fn(&IpAddr) -> bool>(&self, f: F) -> bool {
        match self.sess.destination.ip() {
            Some(ip) => f(&ip),
            None => self.sess.destination_addresses.iter().any(f),
        }
    }
}

pub trait Condition: Send + Sync + fmt::Display {
    fn apply(&self, ctx: &MatchContext) -> bool;

    /// Whether matching needs the destination's addresses, so a domain
    /// destination must be resolved first.
    fn needs_destination_ip(&self) -> bool {
        false
    }
}

fn describe<T: fmt::Display>(name: &str, values: &[T]) -> String {
    if values.len() == 1 {
        format!("{}={}", name, values[0])
    } else {
        let values: Vec<String> = values.iter().map(ToString::to_string).collect();
        format!("{}=[{}]", name, values.join(" "))
    }
}

/// Matches a string field of the session against a set of values.
struct FieldCondition {
    values: HashSet<String>,
    field: fn(&MatchContext) -> Option<String>,
    ignore_case: bool,
    desc: String,
}

impl FieldCondition {
    fn new(
        name: &'static str,
        values: &[String],
        ignore_case: bool,
        field: fn(&MatchContext) -> Option<String>,
    ) -> Self {
        let desc = describe(name, values);
        let values = values
            .iter()
            .map(|v| {
                if ignore_case {
                    v.to_ascii_lowercase()
                } else {
                    v.clone()
                }
            })
            .collect();
        FieldCondition {
            values,
            field,
            ignore_case,
            desc,
        }
    }
}

impl Condition for FieldCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        match (self.field)(ctx) {
            Some(v) if self.ignore_case => self.values.contains(&v.to_ascii_lowercase()),
            Some(v) => self.values.contains(&v),
            None => false,
        }
    }
}

impl fmt::Display for FieldCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.desc)
    }
}

struct NetworkCondition(Vec<Network>);

impl Condition for NetworkCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        self.0.contains(&ctx.sess.network)
    }
}

impl fmt::Display for NetworkCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&describe("network", &self.0))
    }
}

struct IpVersionCondition(u8);

impl Condition for IpVersionCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        ctx.any_destination_ip(|ip| match ip {
            IpAddr::V4(_) => self.0 == 4,
            IpAddr::V6(_) => self.0 == 6,
        })
    }

    fn needs_destination_ip(&self) -> bool {
        true
    }
}

impl fmt::Display for IpVersionCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ip_version={}", self.0)
    }
}

struct UserIdCondition(Vec<u32>);

impl Condition for UserIdCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        ctx.sess
            .process
            .as_ref()
            .and_then(|p| p.user_id)
            .map(|id| self.0.contains(&id))
            .unwrap_or(false)
    }
}

impl fmt::Display for UserIdCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&describe("user_id", &self.0))
    }
}

#[derive(Default)]
pub struct DomainCondition {
    full: HashSet<String>,
    suffix: Vec<String>,
    keyword: Vec<String>,
    regex: Vec<Regex>,
    desc: String,
}

impl DomainCondition {
    fn is_empty(&self) -> bool {
        self.full.is_empty()
            && self.suffix.is_empty()
            && self.keyword.is_empty()
            && self.regex.is_empty()
    }

    fn add_regex(&mut self, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern).map_err(|e| anyhow!("invalid domain_regex {}: {}", pattern, e))?;
        self.regex.push(re);
        Ok(())
    }

    fn from_config(cfg: &RuleConfig) -> Result<Self> {
        let mut cond = DomainCondition::default();
        let mut desc = Vec::new();
        if !cfg.domain.is_empty() {
            cond.full
                .extend(cfg.domain.iter().map(|d| d.to_ascii_lowercase()));
            desc.push(describe("domain", &cfg.domain));
        }
        if !cfg.domain_suffix.is_empty() {
            cond.suffix
                .extend(cfg.domain_suffix.iter().map(|d| d.to_ascii_lowercase()));
            desc.push(describe("domain_suffix", &cfg.domain_suffix));
        }
        if !cfg.domain_keyword.is_empty() {
            cond.keyword
                .extend(cfg.domain_keyword.iter().map(|d| d.to_ascii_lowercase()));
            desc.push(describe("domain_keyword", &cfg.domain_keyword));
        }
        for pattern in cfg.domain_regex.iter() {
            cond.add_regex(pattern)?;
        }
        if !cfg.domain_regex.is_empty() {
            desc.push(describe("domain_regex", &cfg.domain_regex));
        }
        cond.desc = desc.join(" ");
        Ok(cond)
    }

    /// A suffix with a leading dot only matches subdomains.
    fn match_suffix(suffix: &str, domain: &str) -> bool {
        if suffix.starts_with('.') {
            return domain.ends_with(suffix);
        }
        domain == suffix
            || (domain.len() > suffix.len()
                && domain.ends_with(suffix)
                && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.')
    }

    pub fn matches(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        self.full.contains(&domain)
            || self.suffix.iter().any(|s| Self::match_suffix(s, &domain))
            || self.keyword.iter().any(|k| domain.contains(k.as_str()))
            || self.regex.iter().any(|r| r.is_match(&domain))
    }
}

impl Condition for DomainCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        ctx.sess.domain().map(|d| self.matches(d)).unwrap_or(false)
    }
}

impl fmt::Display for DomainCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.desc)
    }
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
                || (o[0] == 100 && (o[1] & 0xc0) == 64)
        }
        IpAddr::V6(ip) => {
            let first = ip.segments()[0];
            ip.is_loopback()
                || ip.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || ip.to_ipv4_mapped().map(|v4| is_private(&IpAddr::V4(v4))).unwrap_or(false)
        }
    }
}

struct IpCidrCondition {
    cidrs: Vec<IpCidr>,
    source: bool,
    desc: String,
}

/// Accepts both `10.0.0.0/8` and bare addresses; host bits are masked.
pub fn parse_cidr(s: &str) -> Result<IpCidr> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(IpCidr::new_host(ip));
    }
    IpInet::from_str(s)
        .map(|inet| inet.network())
        .map_err(|e| anyhow!("invalid ip cidr {}: {}", s, e))
}

impl IpCidrCondition {
    fn new(values: &[String], source: bool) -> Result<Self> {
        let cidrs = values
            .iter()
            .map(|s| parse_cidr(s))
            .collect::<Result<Vec<_>>>()?;
        let name = if source { "source_ip_cidr" } else { "ip_cidr" };
        Ok(IpCidrCondition {
            cidrs,
            source,
            desc: describe(name, values),
        })
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        self.cidrs.iter().any(|c| c.contains(ip))
    }
}

impl Condition for IpCidrCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        if self.source || ctx.ip_cidr_match_source {
            self.contains(&ctx.sess.source.ip())
        } else {
            ctx.any_destination_ip(|ip| self.contains(ip))
        }
    }

    fn needs_destination_ip(&self) -> bool {
        !self.source
    }
}

impl fmt::Display for IpCidrCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.desc)
    }
}

struct IpIsPrivateCondition {
    source: bool,
}

impl Condition for IpIsPrivateCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        if self.source {
            is_private(&ctx.sess.source.ip())
        } else {
            ctx.any_destination_ip(is_private)
        }
    }

    fn needs_destination_ip(&self) -> bool {
        !self.source
    }
}

impl fmt::Display for IpIsPrivateCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.source {
            f.write_str("source_ip_is_private")
        } else {
            f.write_str("ip_is_private")
        }
    }
}

struct GeoIpCondition {
    codes: Vec<String>,
    source: bool,
}

impl GeoIpCondition {
    fn matches(&self, env: &RuleEnv, ip: &IpAddr) -> bool {
        if self.codes.iter().any(|c| c == "private") && is_private(ip) {
            return true;
        }
        env.geoip()
            .and_then(|reader| reader.lookup(*ip))
            .map(|code| self.codes.contains(&code))
            .unwrap_or(false)
    }
}

impl Condition for GeoIpCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        if self.source {
            self.matches(ctx.env, &ctx.sess.source.ip())
        } else {
            ctx.any_destination_ip(|ip| self.matches(ctx.env, ip))
        }
    }

    fn needs_destination_ip(&self) -> bool {
        !self.source
    }
}

impl fmt::Display for GeoIpCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = if self.source { "source_geoip" } else { "geoip" };
        f.write_str(&describe(name, &self.codes))
    }
}

struct GeositeCondition {
    codes: Vec<String>,
    domains: DomainCondition,
}

impl Condition for GeositeCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        self.domains.apply(ctx)
    }
}

impl fmt::Display for GeositeCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&describe("geosite", &self.codes))
    }
}

/// Parses `1000:2000`, `:2000` and `1000:` into an inclusive range.
pub fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    let (start, end) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid port range: {}", s))?;
    let parse = |v: &str, default: u16| -> Result<u16> {
        if v.is_empty() {
            Ok(default)
        } else {
            v.trim()
                .parse::<u16>()
                .map_err(|e| anyhow!("invalid port range {}: {}", s, e))
        }
    };
    let start = parse(start, 0)?;
    let end = parse(end, u16::MAX)?;
    if start > end {
        return Err(anyhow!("invalid port range: {}", s));
    }
    Ok((start, end))
}

struct PortCondition {
    ports: Vec<u16>,
    ranges: Vec<(u16, u16)>,
    source: bool,
    desc: String,
}

impl PortCondition {
    fn new(ports: &[u16], ranges: &[String], source: bool) -> Result<Self> {
        let parsed = ranges
            .iter()
            .map(|r| parse_port_range(r))
            .collect::<Result<Vec<_>>>()?;
        let prefix = if source { "source_" } else { "" };
        let mut desc = Vec::new();
        if !ports.is_empty() {
            desc.push(describe(&format!("{}port", prefix), ports));
        }
        if !ranges.is_empty() {
            desc.push(describe(&format!("{}port_range", prefix), ranges));
        }
        Ok(PortCondition {
            ports: ports.to_vec(),
            ranges: parsed,
            source,
            desc: desc.join(" "),
        })
    }
}

impl Condition for PortCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        let port = if self.source {
            ctx.sess.source.port()
        } else {
            ctx.sess.destination.port()
        };
        self.ports.contains(&port) || self.ranges.iter().any(|(s, e)| *s <= port && port <= *e)
    }
}

impl fmt::Display for PortCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.desc)
    }
}

struct ClashModeCondition(String);

impl Condition for ClashModeCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        ctx.env.clash_mode().eq_ignore_ascii_case(&self.0)
    }
}

impl fmt::Display for ClashModeCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "clash_mode={}", self.0)
    }
}

struct RuleSetCondition {
    tags: Vec<String>,
    sets: Vec<Arc<RuleSet>>,
    match_source: bool,
}

impl Condition for RuleSetCondition {
    fn apply(&self, ctx: &MatchContext) -> bool {
        let ctx = MatchContext {
            sess: ctx.sess,
            env: ctx.env,
            ip_cidr_match_source: self.match_source,
        };
        self.sets.iter().any(|set| set.matches(&ctx))
    }

    fn needs_destination_ip(&self) -> bool {
        !self.match_source && self.sets.iter().any(|set| set.needs_destination_ip())
    }
}

impl fmt::Display for RuleSetCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&describe("rule_set", &self.tags))?;
        if self.match_source {
            f.write_str(" rule_set_ipcidr_match_source")?;
        }
        Ok(())
    }
}

/// A conjunction of disjunctive groups. Fields describing the same side of
/// the connection share one group, e.g. `domain` or `ip_cidr`.
pub struct DefaultRule {
    groups: Vec<Vec<Box<dyn Condition>>>,
    invert: bool,
}

impl DefaultRule {
    fn apply(&self, ctx: &MatchContext) -> bool {
        let matched = self
            .groups
            .iter()
            .all(|group| group.iter().any(|c| c.apply(ctx)));
        matched != self.invert
    }

    fn needs_destination_ip(&self) -> bool {
        self.groups.iter().flatten().any(|c| c.needs_destination_ip())
    }
}

impl fmt::Display for DefaultRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self
            .groups
            .iter()
            .map(|group| {
                let items: Vec<String> = group.iter().map(ToString::to_string).collect();
                if items.len() > 1 {
                    format!("({})", items.join(" || "))
                } else {
                    items.join("")
                }
            })
            .collect();
        let body = if parts.is_empty() {
            "any".to_string()
        } else {
            parts.join(" ")
        };
        if self.invert {
            write!(f, "!({})", body)
        } else {
            f.write_str(&body)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalMode {
    And,
    Or,
}

pub struct LogicalRule {
    mode: LogicalMode,
    rules: Vec<Rule>,
    invert: bool,
}

impl LogicalRule {
    fn apply(&self, ctx: &MatchContext) -> bool {
        let matched = match self.mode {
            LogicalMode::And => self.rules.iter().all(|r| r.apply(ctx)),
            LogicalMode::Or => self.rules.iter().any(|r| r.apply(ctx)),
        };
        matched != self.invert
    }
}

impl fmt::Display for LogicalRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sep = match self.mode {
            LogicalMode::And => " && ",
            LogicalMode::Or => " || ",
        };
        let parts: Vec<String> = self.rules.iter().map(|r| format!("[{}]", r)).collect();
        if self.invert {
            write!(f, "!({})", parts.join(sep))
        } else {
            write!(f, "({})", parts.join(sep))
        }
    }
}

pub enum Rule {
    Default(DefaultRule),
    Logical(LogicalRule),
}

impl Rule {
    pub fn apply(&self, ctx: &MatchContext) -> bool {
        match self {
            Rule::Default(r) => r.apply(ctx),
            Rule::Logical(r) => r.apply(ctx),
        }
    }

    pub fn needs_destination_ip(&self) -> bool {
        match self {
            Rule::Default(r) => r.needs_destination_ip(),
            Rule::Logical(r) => r.rules.iter().any(Rule::needs_destination_ip),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rule::Default(r) => fmt::Display::fmt(r, f),
            Rule::Logical(r) => fmt::Display::fmt(r, f),
        }
    }
}

/// A compiled rule and the outbound (or DNS server) it routes to.
pub struct TargetRule {
    pub rule: Rule,
    pub target: String,
}

impl TargetRule {
    pub fn new(rule: Rule, target: String) -> Self {
        TargetRule { rule, target }
    }

    pub fn matches(&self, ctx: &MatchContext) -> bool {
        self.rule.apply(ctx)
    }

    pub fn needs_destination_ip(&self) -> bool {
        self.rule.needs_destination_ip()
    }
}

impl fmt::Display for TargetRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} => {}", self.rule, self.target)
    }
}

/// Compiles rule declarations. Headless builders compile rule-set contents,
/// which cannot reference databases or other rule-sets.
pub struct RuleBuilder<'a> {
    env: Option<&'a RuleEnv>,
}

impl<'a> RuleBuilder<'a> {
    pub fn new(env: &'a RuleEnv) -> Self {
        RuleBuilder { env: Some(env) }
    }

    pub fn headless() -> Self {
        RuleBuilder { env: None }
    }

    pub fn build(&self, cfg: &RuleConfig) -> Result<Rule> {
        match cfg.rule_type.as_deref() {
            None | Some("") | Some("default") => {
                if !cfg.rules.is_empty() {
                    return Err(anyhow!("default rule cannot have sub rules"));
                }
                Ok(Rule::Default(self.build_default(cfg)?))
            }
            Some("logical") => {
                let mode = match cfg.mode.as_deref() {
                    Some("and") => LogicalMode::And,
                    Some("or") => LogicalMode::Or,
                    Some(m) => return Err(anyhow!("unknown logical mode: {}", m)),
                    None => return Err(anyhow!("missing logical mode")),
                };
                if cfg.rules.is_empty() {
                    return Err(anyhow!("missing sub rules"));
                }
                let mut rules = Vec::with_capacity(cfg.rules.len());
                for (i, sub) in cfg.rules.iter().enumerate() {
                    rules.push(self.build(sub).with_context(|| format!("sub rule[{}]", i))?);
                }
                Ok(Rule::Logical(LogicalRule {
                    mode,
                    rules,
                    invert: cfg.invert,
                }))
            }
            Some(t) => Err(anyhow!("unknown rule type: {}", t)),
        }
    }

    fn env(&self, field: &str) -> Result<&'a RuleEnv> {
        self.env
            .ok_or_else(|| anyhow!("{} is not allowed in rule-set rules", field))
    }

    fn build_default(&self, cfg: &RuleConfig) -> Result<DefaultRule> {
        let mut groups: Vec<Vec<Box<dyn Condition>>> = Vec::new();

        if !cfg.inbound.is_empty() {
            groups.push(vec![Box::new(FieldCondition::new(
                "inbound",
                &cfg.inbound,
                false,
                |ctx| Some(ctx.sess.inbound_tag.clone()),
            ))]);
        }
        if let Some(v) = cfg.ip_version {
            if v != 4 && v != 6 {
                return Err(anyhow!("invalid ip_version: {}", v));
            }
            groups.push(vec![Box::new(IpVersionCondition(v))]);
        }
        if !cfg.network.is_empty() {
            let networks = cfg
                .network
                .iter()
                .map(|n| n.parse::<Network>())
                .collect::<Result<Vec<_>>>()?;
            groups.push(vec![Box::new(NetworkCondition(networks))]);
        }
        if !cfg.auth_user.is_empty() {
            groups.push(vec![Box::new(FieldCondition::new(
                "auth_user",
                &cfg.auth_user,
                false,
                |ctx| ctx.sess.auth_user.clone(),
            ))]);
        }
        if !cfg.protocol.is_empty() {
            groups.push(vec![Box::new(FieldCondition::new(
                "protocol",
                &cfg.protocol,
                true,
                |ctx| ctx.sess.protocol.clone(),
            ))]);
        }

        let mut destination: Vec<Box<dyn Condition>> = Vec::new();
        let domains = DomainCondition::from_config(cfg)?;
        if !domains.is_empty() {
            destination.push(Box::new(domains));
        }
        if !cfg.geosite.is_empty() {
            let env = self.env("geosite")?;
            let reader = env
                .geosite()
                .ok_or_else(|| anyhow!("geosite database is not loaded"))?;
            let mut domains = DomainCondition::default();
            for code in cfg.geosite.iter() {
                for item in reader.load(code)? {
                    let value = item.value.to_ascii_lowercase();
                    match item.kind {
                        GeositeItemKind::Domain => {
                            domains.full.insert(value);
                        }
                        GeositeItemKind::DomainSuffix => domains.suffix.push(value),
                        GeositeItemKind::DomainKeyword => domains.keyword.push(value),
                        GeositeItemKind::DomainRegex => domains.add_regex(&item.value)?,
                    }
                }
            }
            destination.push(Box::new(GeositeCondition {
                codes: cfg.geosite.to_vec(),
                domains,
            }));
        }
        if !cfg.geoip.is_empty() {
            destination.push(self.build_geoip(&cfg.geoip, false)?);
        }
        if !cfg.ip_cidr.is_empty() {
            destination.push(Box::new(IpCidrCondition::new(&cfg.ip_cidr, false)?));
        }
        if cfg.ip_is_private {
            destination.push(Box::new(IpIsPrivateCondition { source: false }));
        }
        if !destination.is_empty() {
            groups.push(destination);
        }

        let mut source: Vec<Box<dyn Condition>> = Vec::new();
        if !cfg.source_geoip.is_empty() {
            source.push(self.build_geoip(&cfg.source_geoip, true)?);
        }
        if !cfg.source_ip_cidr.is_empty() {
            source.push(Box::new(IpCidrCondition::new(&cfg.source_ip_cidr, true)?));
        }
        if cfg.source_ip_is_private {
            source.push(Box::new(IpIsPrivateCondition { source: true }));
        }
        if !source.is_empty() {
            groups.push(source);
        }

        if !cfg.source_port.is_empty() || !cfg.source_port_range.is_empty() {
            groups.push(vec![Box::new(PortCondition::new(
                &cfg.source_port,
                &cfg.source_port_range,
                true,
            )?)]);
        }
        if !cfg.port.is_empty() || !cfg.port_range.is_empty() {
            groups.push(vec![Box::new(PortCondition::new(
                &cfg.port,
                &cfg.port_range,
                false,
            )?)]);
        }

        if !cfg.process_name.is_empty() {
            groups.push(vec![Box::new(FieldCondition::new(
                "process_name",
                &cfg.process_name,
                false,
                |ctx| ctx.sess.process.as_ref().and_then(|p| p.name.clone()),
            ))]);
        }
        if !cfg.process_path.is_empty() {
            groups.push(vec![Box::new(FieldCondition::new(
                "process_path",
                &cfg.process_path,
                false,
                |ctx| ctx.sess.process.as_ref().and_then(|p| p.path.clone()),
            ))]);
        }
        if !cfg.package_name.is_empty() {
            groups.push(vec![Box::new(FieldCondition::new(
                "package_name",
                &cfg.package_name,
                false,
                |ctx| ctx.sess.process.as_ref().and_then(|p| p.package_name.clone()),
            ))]);
        }
        if !cfg.user.is_empty() {
            groups.push(vec![Box::new(FieldCondition::new(
                "user",
                &cfg.user,
                false,
                |ctx| ctx.sess.process.as_ref().and_then(|p| p.user.clone()),
            ))]);
        }
        if !cfg.user_id.is_empty() {
            groups.push(vec![Box::new(UserIdCondition(cfg.user_id.to_vec()))]);
        }
        if let Some(mode) = &cfg.clash_mode {
            self.env("clash_mode")?;
            groups.push(vec![Box::new(ClashModeCondition(mode.clone()))]);
        }
        if !cfg.wifi_ssid.is_empty() {
            groups.push(vec![Box::new(FieldCondition::new(
                "wifi_ssid",
                &cfg.wifi_ssid,
                false,
                |ctx| ctx.env.network_state().wifi_ssid,
            ))]);
        }
        if !cfg.wifi_bssid.is_empty() {
            groups.push(vec![Box::new(FieldCondition::new(
                "wifi_bssid",
                &cfg.wifi_bssid,
                true,
                |ctx| ctx.env.network_state().wifi_bssid,
            ))]);
        }
        if !cfg.rule_set.is_empty() {
            let env = self.env("rule_set")?;
            let sets = cfg
                .rule_set
                .iter()
                .map(|tag| {
                    env.rule_set(tag)
                        .ok_or_else(|| anyhow!("rule-set not found: {}", tag))
                })
                .collect::<Result<Vec<_>>>()?;
            groups.push(vec![Box::new(RuleSetCondition {
                tags: cfg.rule_set.to_vec(),
                sets,
                match_source: cfg.rule_set_ipcidr_match_source,
            })]);
        }

        Ok(DefaultRule {
            groups,
            invert: cfg.invert,
        })
    }

    fn build_geoip(&self, codes: &[String], source: bool) -> Result<Box<dyn Condition>> {
        let field = if source { "source_geoip" } else { "geoip" };
        let codes: Vec<String> = codes.iter().map(|c| c.to_ascii_lowercase()).collect();
        let only_private = codes.iter().all(|c| c == "private");
        if !only_private {
            let env = self.env(field)?;
            if env.geoip().is_none() {
                return Err(anyhow!("geoip database is not loaded"));
            }
        }
        Ok(Box::new(GeoIpCondition { codes, source }))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::app::router::NetworkState;
    use crate::config::Listable;
    use crate::session::SocksAddr;

    fn list(values: &[&str]) -> Listable<String> {
        Listable(values.iter().map(|s| s.to_string()).collect())
    }

    fn session(dest: &str) -> Session {
        Session {
            inbound_tag: "mixed-in".to_string(),
            source: "192.168.1.7:50000".parse::<SocketAddr>().unwrap(),
            destination: dest.parse::<SocksAddr>().unwrap(),
            ..Default::default()
        }
    }

    fn apply(rule: &Rule, sess: &Session) -> bool {
        let env = RuleEnv::empty();
        rule.apply(&MatchContext::new(sess, &env))
    }

    fn build(cfg: &RuleConfig) -> Rule {
        let env = RuleEnv::empty();
        RuleBuilder::new(&env).build(cfg).unwrap()
    }

    #[test]
    fn test_domain_matchers() {
        let rule = build(&RuleConfig {
            domain: list(&["exact.com"]),
            domain_suffix: list(&["example.com", ".sub.org"]),
            domain_keyword: list(&["tracker"]),
            domain_regex: list(&["^ads[0-9]+\\."]),
            ..Default::default()
        });
        assert!(apply(&rule, &session("exact.com:80")));
        assert!(!apply(&rule, &session("a.exact.com:80")));
        assert!(apply(&rule, &session("example.com:443")));
        assert!(apply(&rule, &session("www.example.com:443")));
        assert!(!apply(&rule, &session("notexample.com:443")));
        assert!(!apply(&rule, &session("sub.org:443")));
        assert!(apply(&rule, &session("a.sub.org:443")));
        assert!(apply(&rule, &session("my-tracker.net:443")));
        assert!(apply(&rule, &session("ads12.cdn.io:443")));
        assert!(!apply(&rule, &session("1.2.3.4:443")));
    }

    #[test]
    fn test_groups_are_conjunctive() {
        let rule = build(&RuleConfig {
            domain: list(&["example.com"]),
            ip_cidr: list(&["10.0.0.0/8"]),
            port: Listable(vec![443]),
            network: list(&["tcp"]),
            ..Default::default()
        });
        // domain and ip_cidr share a group
        assert!(apply(&rule, &session("example.com:443")));
        assert!(apply(&rule, &session("10.1.2.3:443")));
        assert!(!apply(&rule, &session("example.com:80")));
        let mut udp = session("example.com:443");
        udp.network = Network::Udp;
        assert!(!apply(&rule, &udp));
        assert!(rule.needs_destination_ip());
    }

    #[test]
    fn test_ports_and_source() {
        let rule = build(&RuleConfig {
            port_range: list(&["1000:2000", ":22", "60000:"]),
            source_ip_cidr: list(&["192.168.0.0/16"]),
            ..Default::default()
        });
        assert!(apply(&rule, &session("1.1.1.1:1500")));
        assert!(apply(&rule, &session("1.1.1.1:22")));
        assert!(apply(&rule, &session("1.1.1.1:65535")));
        assert!(!apply(&rule, &session("1.1.1.1:2001")));
        assert!(!rule.needs_destination_ip());

        let mut other = session("1.1.1.1:1500");
        other.source = "172.16.0.1:1".parse().unwrap();
        assert!(!apply(&rule, &other));

        assert!(parse_port_range("2000:1000").is_err());
        assert!(parse_port_range("1000").is_err());
        assert_eq!(parse_port_range(":").unwrap(), (0, u16::MAX));
    }

    #[test]
    fn test_private_and_resolved_addresses() {
        let rule = build(&RuleConfig {
            ip_is_private: true,
            ..Default::default()
        });
        assert!(apply(&rule, &session("10.0.0.1:80")));
        assert!(apply(&rule, &session("[fe80::1]:80")));
        assert!(!apply(&rule, &session("8.8.8.8:80")));

        let mut sess = session("intranet.corp:80");
        assert!(!apply(&rule, &sess));
        sess.destination_addresses = vec!["8.8.8.8".parse().unwrap(), "192.168.0.3".parse().unwrap()];
        assert!(apply(&rule, &sess));

        let geo = build(&RuleConfig {
            geoip: list(&["private"]),
            ..Default::default()
        });
        assert!(apply(&geo, &session("127.0.0.1:80")));
        assert_eq!(geo.to_string(), "geoip=private");
    }

    #[test]
    fn test_invert_and_logical() {
        let a = RuleConfig {
            domain: list(&["a.com"]),
            ..Default::default()
        };
        let b = RuleConfig {
            port: Listable(vec![443]),
            ..Default::default()
        };
        let not_a = build(&RuleConfig {
            rule_type: Some("logical".to_string()),
            mode: Some("and".to_string()),
            rules: vec![a.clone()],
            invert: true,
            ..Default::default()
        });
        assert!(!apply(&not_a, &session("a.com:443")));
        assert!(apply(&not_a, &session("b.com:443")));

        let and = build(&RuleConfig {
            rule_type: Some("logical".to_string()),
            mode: Some("and".to_string()),
            rules: vec![a.clone(), b.clone()],
            ..Default::default()
        });
        let or = build(&RuleConfig {
            rule_type: Some("logical".to_string()),
            mode: Some("or".to_string()),
            rules: vec![a, b],
            ..Default::default()
        });
        for (dest, want_and, want_or) in [
            ("a.com:443", true, true),
            ("a.com:80", false, true),
            ("b.com:443", false, true),
            ("b.com:80", false, false),
        ] {
            assert_eq!(apply(&and, &session(dest)), want_and, "and {}", dest);
            assert_eq!(apply(&or, &session(dest)), want_or, "or {}", dest);
        }
        assert_eq!(and.to_string(), "([domain=a.com] && [port=443])");

        let inverted = build(&RuleConfig {
            port: Listable(vec![443]),
            invert: true,
            ..Default::default()
        });
        assert!(apply(&inverted, &session("b.com:80")));
        assert_eq!(inverted.to_string(), "!(port=443)");
    }

    #[test]
    fn test_build_errors() {
        let env = RuleEnv::empty();
        let builder = RuleBuilder::new(&env);
        let err = |cfg: RuleConfig| format!("{:#}", builder.build(&cfg).err().unwrap());

        assert_eq!(
            err(RuleConfig {
                rule_type: Some("weird".to_string()),
                ..Default::default()
            }),
            "unknown rule type: weird"
        );
        assert_eq!(
            err(RuleConfig {
                rule_type: Some("logical".to_string()),
                mode: Some("xor".to_string()),
                rules: vec![RuleConfig::default()],
                ..Default::default()
            }),
            "unknown logical mode: xor"
        );
        assert!(err(RuleConfig {
            rule_set: list(&["missing"]),
            ..Default::default()
        })
        .contains("rule-set not found"));
        assert!(err(RuleConfig {
            domain_regex: list(&["("]),
            ..Default::default()
        })
        .contains("invalid domain_regex"));
        assert!(err(RuleConfig {
            geosite: list(&["cn"]),
            ..Default::default()
        })
        .contains("geosite"));

        let headless = RuleBuilder::headless();
        assert!(headless
            .build(&RuleConfig {
                clash_mode: Some("direct".to_string()),
                ..Default::default()
            })
            .is_err());
    }

    #[test]
    fn test_clash_mode_and_wifi() {
        let env = RuleEnv::empty();
        let rule = RuleBuilder::new(&env)
            .build(&RuleConfig {
                clash_mode: Some("Direct".to_string()),
                wifi_ssid: list(&["home"]),
                ..Default::default()
            })
            .unwrap();
        let sess = session("a.com:443");
        assert!(!rule.apply(&MatchContext::new(&sess, &env)));
        env.set_clash_mode("direct");
        assert!(!rule.apply(&MatchContext::new(&sess, &env)));
        env.update_network_state(NetworkState {
            wifi_ssid: Some("home".to_string()),
            wifi_bssid: None,
        });
        assert!(rule.apply(&MatchContext::new(&sess, &env)));
    }
}
