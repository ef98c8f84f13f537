use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rule::{MatchContext, Rule, RuleBuilder};
use crate::config::{self, RuleSetConfig, RuleSetDocument};
use crate::option;

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Compiled rules of one rule-set version.
pub struct RuleSetContent {
    rules: Vec<Rule>,
    needs_destination_ip: bool,
}

impl RuleSetContent {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let doc: RuleSetDocument =
            serde_json::from_slice(data).context("parse rule-set source")?;
        if doc.version == 0 || doc.version > 3 {
            return Err(anyhow!("unsupported rule-set version: {}", doc.version));
        }
        Self::compile(&doc.rules)
    }

    pub fn compile(rules: &[config::RuleConfig]) -> Result<Self> {
        let builder = RuleBuilder::headless();
        let mut compiled = Vec::with_capacity(rules.len());
        for (i, rule) in rules.iter().enumerate() {
            compiled.push(builder.build(rule).with_context(|| format!("rule[{}]", i))?);
        }
        let needs_destination_ip = compiled.iter().any(Rule::needs_destination_ip);
        Ok(RuleSetContent {
            rules: compiled,
            needs_destination_ip,
        })
    }
}

#[derive(Debug, Clone)]
pub enum RuleSetSource {
    Local(PathBuf),
    Remote {
        url: String,
        update_interval: Duration,
        cache_path: Option<PathBuf>,
    },
}

/// A named rule-set. The content is swapped as a whole on refresh, so a match
/// in progress keeps the version it started with.
pub struct RuleSet {
    tag: String,
    source: RuleSetSource,
    content: RwLock<Option<Arc<RuleSetContent>>>,
    updated_at: Mutex<Option<SystemTime>>,
}

impl RuleSet {
    pub fn new(cfg: &RuleSetConfig) -> Result<Self> {
        if let Some(format) = cfg.format.as_deref() {
            if format != "source" {
                return Err(anyhow!("rule-set [{}]: unsupported format: {}", cfg.tag, format));
            }
        }
        let source = match cfg.kind.as_str() {
            "local" => {
                let path = cfg
                    .path
                    .as_ref()
                    .ok_or_else(|| anyhow!("rule-set [{}]: missing path", cfg.tag))?;
                RuleSetSource::Local(PathBuf::from(path))
            }
            "remote" => {
                let url = cfg
                    .url
                    .clone()
                    .ok_or_else(|| anyhow!("rule-set [{}]: missing url", cfg.tag))?;
                url::Url::parse(&url)
                    .map_err(|e| anyhow!("rule-set [{}]: invalid url {}: {}", cfg.tag, url, e))?;
                if let Some(detour) = &cfg.download_detour {
                    warn!(
                        "rule-set [{}]: download_detour [{}] ignored, downloading directly",
                        cfg.tag, detour
                    );
                }
                RuleSetSource::Remote {
                    url,
                    update_interval: config::duration_or(
                        cfg.update_interval.as_deref(),
                        DEFAULT_UPDATE_INTERVAL,
                    )?,
                    cache_path: cfg.cache_path.as_ref().map(PathBuf::from),
                }
            }
            t => return Err(anyhow!("rule-set [{}]: unknown type: {}", cfg.tag, t)),
        };
        Ok(RuleSet {
            tag: cfg.tag.clone(),
            source,
            content: RwLock::new(None),
            updated_at: Mutex::new(None),
        })
    }

    /// A rule-set with fixed content, mostly for tests.
    pub fn with_content(tag: String, content: RuleSetContent) -> Self {
        RuleSet {
            tag,
            source: RuleSetSource::Local(PathBuf::new()),
            content: RwLock::new(Some(Arc::new(content))),
            updated_at: Mutex::new(Some(SystemTime::now())),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn source(&self) -> &RuleSetSource {
        &self.source
    }

    pub fn is_loaded(&self) -> bool {
        self.content.read().is_some()
    }

    pub fn updated_at(&self) -> Option<SystemTime> {
        *self.updated_at.lock()
    }

    /// A set that is not loaded yet never matches.
    pub fn matches(&self, ctx: &MatchContext) -> bool {
        let content = self.content.read().clone();
        match content {
            Some(content) => content.rules.iter().any(|r| r.apply(ctx)),
            None => false,
        }
    }

    /// False while not loaded: nothing to match, so nothing to resolve.
    pub fn needs_destination_ip(&self) -> bool {
        self.content
            .read()
            .as_ref()
            .map(|c| c.needs_destination_ip)
            .unwrap_or(false)
    }

    fn swap(&self, content: RuleSetContent, updated_at: SystemTime) {
        *self.content.write() = Some(Arc::new(content));
        *self.updated_at.lock() = Some(updated_at);
    }

    /// Loads what is available locally: the file of a local set, the cache of
    /// a remote one. Returns whether a remote set should download right away.
    pub async fn load(&self) -> Result<bool> {
        match &self.source {
            RuleSetSource::Local(path) => {
                let data = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("read {}", path.display()))?;
                self.swap(RuleSetContent::parse(&data)?, SystemTime::now());
                info!("rule-set [{}] loaded from {}", &self.tag, path.display());
                Ok(false)
            }
            RuleSetSource::Remote {
                update_interval,
                cache_path,
                ..
            } => {
                let path = match cache_path {
                    Some(p) => p,
                    None => return Ok(true),
                };
                let (data, modified) = match read_cache(path).await {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("rule-set [{}] no usable cache: {:#}", &self.tag, e);
                        return Ok(true);
                    }
                };
                match RuleSetContent::parse(&data) {
                    Ok(content) => {
                        self.swap(content, modified);
                        let age = SystemTime::now()
                            .duration_since(modified)
                            .unwrap_or_default();
                        debug!("rule-set [{}] loaded cache, age {:?}", &self.tag, age);
                        Ok(age >= *update_interval)
                    }
                    Err(e) => {
                        warn!("rule-set [{}] invalid cache {}: {:#}", &self.tag, path.display(), e);
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Downloads a remote set and swaps it in. On failure the previous
    /// content stays.
    pub async fn update(&self) -> Result<()> {
        let (url, cache_path) = match &self.source {
            RuleSetSource::Remote {
                url, cache_path, ..
            } => (url, cache_path),
            RuleSetSource::Local(_) => return Ok(()),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(*option::RULE_SET_FETCH_TIMEOUT))
            .build()?;
        let data = client
            .get(url.as_str())
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let content = RuleSetContent::parse(&data)?;
        self.swap(content, SystemTime::now());
        info!("rule-set [{}] updated from {} ({} bytes)", &self.tag, url, data.len());
        if let Some(path) = cache_path {
            if let Err(e) = tokio::fs::write(path, &data).await {
                warn!("rule-set [{}] write cache {}: {}", &self.tag, path.display(), e);
            }
        }
        Ok(())
    }

    /// Keeps a remote set fresh until `token` is cancelled. Downloads across
    /// all sets share `limit`.
    pub fn spawn_updates(
        self: Arc<Self>,
        download_now: bool,
        limit: Arc<Semaphore>,
        token: CancellationToken,
    ) {
        let interval = match &self.source {
            RuleSetSource::Remote {
                update_interval, ..
            } => *update_interval,
            RuleSetSource::Local(_) => return,
        };
        tokio::spawn(async move {
            let mut wait = if download_now {
                Duration::ZERO
            } else {
                self.updated_at()
                    .and_then(|t| t.checked_add(interval))
                    .and_then(|due| due.duration_since(SystemTime::now()).ok())
                    .unwrap_or(Duration::ZERO)
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                let permit = tokio::select! {
                    _ = token.cancelled() => break,
                    p = limit.clone().acquire_owned() => p,
                };
                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    r = self.update() => r,
                };
                drop(permit);
                if let Err(e) = result {
                    warn!("rule-set [{}] update failed: {:#}", &self.tag, e);
                }
                wait = interval;
            }
            debug!("rule-set [{}] updates stopped", &self.tag);
        });
    }
}

async fn read_cache(path: &std::path::Path) -> Result<(Vec<u8>, SystemTime)> {
    let modified = tokio::fs::metadata(path).await?.modified()?;
    let data = tokio::fs::read(path).await?;
    Ok((data, modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::router::RuleEnv;
    use crate::session::{Session, SocksAddr};

    const SOURCE: &str = r#"{
        "version": 1,
        "rules": [
            {"domain_suffix": ["ads.example"]},
            {"ip_cidr": ["203.0.113.0/24"]}
        ]
    }"#;

    fn config(kind: &str) -> RuleSetConfig {
        RuleSetConfig {
            kind: kind.to_string(),
            tag: "ads".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_content() {
        let content = RuleSetContent::parse(SOURCE.as_bytes()).unwrap();
        assert_eq!(content.rules.len(), 2);
        assert!(content.needs_destination_ip);

        assert!(RuleSetContent::parse(br#"{"version": 9, "rules": []}"#).is_err());
        assert!(RuleSetContent::parse(br#"{"version": 1, "rules": [{"rule_set": "x"}]}"#).is_err());
    }

    #[test]
    fn test_new_validates() {
        assert!(RuleSet::new(&config("local")).is_err());
        assert!(RuleSet::new(&config("remote")).is_err());
        assert!(RuleSet::new(&config("inline")).is_err());

        let mut cfg = config("remote");
        cfg.url = Some("https://example.com/ads.json".to_string());
        cfg.update_interval = Some("12h".to_string());
        let set = RuleSet::new(&cfg).unwrap();
        match set.source() {
            RuleSetSource::Remote {
                update_interval, ..
            } => assert_eq!(*update_interval, Duration::from_secs(12 * 3600)),
            _ => panic!("expected remote source"),
        }
        assert!(!set.is_loaded());
        assert!(!set.needs_destination_ip());

        cfg.format = Some("binary".to_string());
        assert!(RuleSet::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_unloaded_set_does_not_match() {
        let mut cfg = config("remote");
        cfg.url = Some("https://example.com/ads.json".to_string());
        let set = RuleSet::new(&cfg).unwrap();
        let env = RuleEnv::empty();
        let sess = Session {
            destination: SocksAddr::Domain("x.ads.example".to_string(), 443),
            ..Default::default()
        };
        assert!(!set.matches(&MatchContext::new(&sess, &env)));

        // No cache path: download immediately.
        assert!(set.load().await.unwrap());
    }

    #[tokio::test]
    async fn test_load_local_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ads.json");
        std::fs::write(&path, SOURCE).unwrap();

        let mut cfg = config("local");
        cfg.path = Some(path.to_string_lossy().to_string());
        let set = RuleSet::new(&cfg).unwrap();
        assert!(!set.load().await.unwrap());
        let env = RuleEnv::empty();
        let sess = Session {
            destination: SocksAddr::Domain("x.ads.example".to_string(), 443),
            ..Default::default()
        };
        assert!(set.matches(&MatchContext::new(&sess, &env)));

        // A fresh cache skips the first download.
        let mut cfg = config("remote");
        cfg.url = Some("https://example.com/ads.json".to_string());
        cfg.cache_path = Some(path.to_string_lossy().to_string());
        let set = RuleSet::new(&cfg).unwrap();
        assert!(!set.load().await.unwrap());
        assert!(set.is_loaded());
        assert!(set.updated_at().is_some());
    }
}
