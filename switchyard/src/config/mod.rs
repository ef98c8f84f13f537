use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

mod json;

pub use json::*;

pub fn from_string(s: &str) -> Result<Config> {
    let config: Config = serde_json::from_str(s).context("parse config")?;
    Ok(config)
}

pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    from_string(&s)
}

/// Parses a Go style duration such as `300ms`, `3m` or `1d`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let d = humantime::parse_duration(s.trim())
        .map_err(|e| anyhow!("invalid duration {:?}: {}", s, e))?;
    Ok(d)
}

/// Parses an optional duration setting, falling back to `default`.
pub fn duration_or(s: Option<&str>, default: Duration) -> Result<Duration> {
    match s {
        Some(s) if !s.trim().is_empty() => parse_duration(s),
        _ => Ok(default),
    }
}

const LOGICAL_MODES: &[&str] = &["and", "or"];

fn check_rule(rule: &RuleConfig, rule_sets: &HashSet<&str>) -> Result<()> {
    match rule.rule_type.as_deref() {
        None | Some("") | Some("default") => {
            if !rule.rules.is_empty() {
                return Err(anyhow!("nested rules are only allowed in logical rules"));
            }
        }
        Some("logical") => {
            let mode = rule.mode.as_deref().unwrap_or("");
            if !LOGICAL_MODES.contains(&mode) {
                return Err(anyhow!("unknown logical mode: {}", mode));
            }
            if rule.rules.is_empty() {
                return Err(anyhow!("missing sub rules"));
            }
            for (i, sub) in rule.rules.iter().enumerate() {
                check_rule(sub, rule_sets).with_context(|| format!("sub rule[{}]", i))?;
            }
        }
        Some(t) => return Err(anyhow!("unknown rule type: {}", t)),
    }
    for tag in rule.rule_set.iter() {
        if !rule_sets.contains(tag.as_str()) {
            return Err(anyhow!("rule-set not found: {}", tag));
        }
    }
    Ok(())
}

fn check_unique<I>(kind: &str, tags: I) -> Result<()>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    for tag in tags {
        if !seen.insert(tag.clone()) {
            return Err(anyhow!("duplicate {} tag: {}", kind, tag));
        }
    }
    Ok(())
}

impl Config {
    /// Structural validation that needs no I/O.
    pub fn check(&self) -> Result<()> {
        check_unique(
            "outbound",
            self.outbounds
                .iter()
                .enumerate()
                .map(|(i, o)| o.tag_or_index(i)),
        )?;
        check_unique(
            "dns server",
            self.dns
                .servers
                .iter()
                .enumerate()
                .map(|(i, s)| s.tag.clone().unwrap_or_else(|| i.to_string())),
        )?;
        check_unique(
            "rule-set",
            self.route.rule_set.iter().map(|r| r.tag.clone()),
        )?;

        let rule_sets: HashSet<&str> = self.route.rule_set.iter().map(|r| r.tag.as_str()).collect();
        for (i, rule) in self.route.rules.iter().enumerate() {
            check_rule(rule, &rule_sets).with_context(|| format!("parse route rule[{}]", i))?;
            if rule.outbound.as_deref().unwrap_or("").is_empty() {
                return Err(anyhow!("parse route rule[{}]: missing outbound", i));
            }
        }
        for (i, rule) in self.dns.rules.iter().enumerate() {
            check_rule(rule, &rule_sets).with_context(|| format!("parse dns rule[{}]", i))?;
            if rule.server.as_deref().unwrap_or("").is_empty() {
                return Err(anyhow!("parse dns rule[{}]: missing server", i));
            }
        }
        for rs in self.route.rule_set.iter() {
            match rs.kind.as_str() {
                "local" if rs.path.is_none() => {
                    return Err(anyhow!("parse rule-set[{}]: missing path", rs.tag))
                }
                "remote" if rs.url.is_none() => {
                    return Err(anyhow!("parse rule-set[{}]: missing url", rs.tag))
                }
                "local" | "remote" => (),
                t => return Err(anyhow!("parse rule-set[{}]: unknown type: {}", rs.tag, t)),
            }
            match rs.format.as_deref() {
                None | Some("source") => (),
                Some(f) => {
                    return Err(anyhow!(
                        "parse rule-set[{}]: unsupported format: {}",
                        rs.tag,
                        f
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::dns::DomainStrategy;

    #[test]
    fn test_parse_config() {
        let config = from_string(
            r#"{
                "log": { "level": "debug" },
                "dns": {
                    "servers": [
                        { "tag": "google", "address": "tcp://8.8.8.8" },
                        { "tag": "local", "address": "local" }
                    ],
                    "final": "google",
                    "strategy": "prefer_ipv4"
                },
                "outbounds": [
                    { "type": "direct", "tag": "direct" },
                    { "type": "urltest", "tag": "auto", "outbounds": ["direct"], "interval": "1m" }
                ],
                "route": {
                    "rules": [
                        { "domain_suffix": "example.com", "outbound": "auto" },
                        { "port": 53, "outbound": "direct" }
                    ],
                    "final": "direct"
                }
            }"#,
        )
        .unwrap();
        config.check().unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.dns.strategy, DomainStrategy::PreferIpv4);
        assert_eq!(config.dns.final_server.as_deref(), Some("google"));
        assert_eq!(config.route.rules[0].domain_suffix.0, vec!["example.com"]);
        assert_eq!(config.route.rules[1].port.0, vec![53]);
        let settings: UrlTestOutboundSettings = config.outbounds[1].parse_settings().unwrap();
        assert_eq!(settings.interval.as_deref(), Some("1m"));
        assert_eq!(settings.outbounds, vec!["direct"]);
    }

    #[test]
    fn test_check_rejects_bad_rules() {
        let config = from_string(
            r#"{ "route": { "rules": [
                { "type": "logical", "mode": "xor", "rules": [{ "domain": "a.com" }], "outbound": "direct" }
            ] } }"#,
        )
        .unwrap();
        let err = format!("{:#}", config.check().unwrap_err());
        assert!(err.contains("parse route rule[0]"), "{}", err);
        assert!(err.contains("unknown logical mode: xor"), "{}", err);

        let config = from_string(
            r#"{ "route": { "rules": [ { "rule_set": "missing", "outbound": "direct" } ] } }"#,
        )
        .unwrap();
        assert!(config.check().is_err());

        let config = from_string(
            r#"{ "outbounds": [ { "type": "direct", "tag": "a" }, { "type": "block", "tag": "a" } ] }"#,
        )
        .unwrap();
        let err = config.check().unwrap_err().to_string();
        assert_eq!(err, "duplicate outbound tag: a");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert!(parse_duration("soon").is_err());
        assert_eq!(
            duration_or(None, Duration::from_secs(5)).unwrap(),
            Duration::from_secs(5)
        );
    }
}
