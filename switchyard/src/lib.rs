#[macro_use]
extern crate lazy_static;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

pub mod app;
pub mod common;
pub mod config;
pub mod option;
pub mod proxy;
pub mod session;

use app::dns::{DnsClient, DnsHandle};
use app::history::HistoryStorage;
use app::outbound::manager::OutboundManager;
use app::router::Router;
use proxy::AnyOutboundHandler;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] anyhow::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dns: {0}")]
    Dns(String),
    #[error("outbound not found: {0}")]
    NoOutbound(String),
    #[error("rule-set [{0}]: {1}")]
    RuleSet(String, String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A started instance: outbounds, DNS and router wired together.
pub struct Runtime {
    pub router: Arc<Router>,
    pub outbounds: Arc<OutboundManager>,
    pub dns: Arc<DnsClient>,
    pub history: Arc<HistoryStorage>,
    dns_handle: Arc<DnsHandle>,
}

impl Runtime {
    /// Builds every component without starting background work.
    pub fn build(config: &config::Config, external: Vec<AnyOutboundHandler>) -> Result<Self> {
        config.check()?;

        let history = Arc::new(HistoryStorage::new());
        let dns_handle = Arc::new(DnsHandle::new());
        let outbounds = Arc::new(OutboundManager::new(
            &config.outbounds,
            dns_handle.clone(),
            history.clone(),
            external,
        )?);
        debug!("loaded {} outbounds", outbounds.handlers().count());

        let env = Arc::new(app::router::RuleEnv::new(config)?);
        let dns = Arc::new(DnsClient::new(
            &config.dns,
            &outbounds,
            env.clone(),
            dns_handle.clone(),
        )?);
        dns_handle.install(dns.clone());

        let router = Arc::new(Router::new(
            &config.route,
            outbounds.clone(),
            dns.clone(),
            env,
        )?);

        Ok(Runtime {
            router,
            outbounds,
            dns,
            history,
            dns_handle,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.router.start().await?;
        self.outbounds.start();
        info!("switchyard started");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.outbounds.close();
        self.router.close();
        self.dns.close();
        self.dns_handle.uninstall();
        info!("switchyard stopped");
    }
}

/// Builds and starts a runtime from `config`.
pub async fn start(config: config::Config) -> Result<Runtime> {
    start_with_outbounds(config, Vec::new()).await
}

/// Like [`start`], with additional outbounds provided by the embedder. They
/// can be referenced by tag from groups, DNS detours and rules.
pub async fn start_with_outbounds(
    config: config::Config,
    external: Vec<AnyOutboundHandler>,
) -> Result<Runtime> {
    let rt = Runtime::build(&config, external)?;
    rt.start().await?;
    Ok(rt)
}
