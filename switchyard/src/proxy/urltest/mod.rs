use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::app::history::{HistoryStorage, ProbeResult};
use crate::config::UrlTestOutboundSettings;
use crate::proxy::{
    AnyOutboundDatagram, AnyOutboundHandler, AnyStream, OutboundGroup, OutboundHandler,
};
use crate::session::{Network, Session};

mod group;
mod probe;

pub use group::UrlTestGroup;

/// A group which picks its member by measured latency.
pub struct Handler {
    group: Arc<UrlTestGroup>,
}

impl Handler {
    pub fn new(
        tag: String,
        actors: Vec<AnyOutboundHandler>,
        settings: &UrlTestOutboundSettings,
        history: Arc<HistoryStorage>,
    ) -> Result<Self> {
        let group = UrlTestGroup::new(tag, actors, settings, history)?;
        Ok(Handler {
            group: Arc::new(group),
        })
    }

    pub fn group(&self) -> &Arc<UrlTestGroup> {
        &self.group
    }

    fn pick(&self, network: Network) -> io::Result<AnyOutboundHandler> {
        self.group.touch();
        if let Some(a) = self.group.selected(network) {
            return Ok(a);
        }
        match self.group.select(network).0 {
            Some(a) => Ok(a),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("[{}] no member supports {}", self.group.tag(), network),
            )),
        }
    }
}

#[async_trait]
impl OutboundHandler for Handler {
    fn tag(&self) -> &str {
        self.group.tag()
    }

    fn network(&self) -> Vec<Network> {
        match self.group.selected(Network::Tcp) {
            Some(a) => a.network(),
            None => vec![Network::Tcp, Network::Udp],
        }
    }

    async fn dial_tcp(&self, sess: &Session) -> io::Result<AnyStream> {
        let a = self.pick(Network::Tcp)?;
        debug!("[{}] dial through [{}]", self.tag(), a.tag());
        match a.dial_tcp(sess).await {
            Ok(stream) => {
                self.group.report_dial(Network::Tcp, &a, true);
                Ok(self.group.interrupter.wrap_stream(stream, sess.is_internal()))
            }
            Err(e) => {
                debug!("[{}] dial through [{}] failed: {}", self.tag(), a.tag(), e);
                self.group.report_dial(Network::Tcp, &a, false);
                Err(e)
            }
        }
    }

    async fn listen_packet(&self, sess: &Session) -> io::Result<AnyOutboundDatagram> {
        let a = self.pick(Network::Udp)?;
        debug!("[{}] listen through [{}]", self.tag(), a.tag());
        match a.listen_packet(sess).await {
            Ok(dgram) => {
                self.group.report_dial(Network::Udp, &a, true);
                Ok(self
                    .group
                    .interrupter
                    .wrap_datagram(dgram, sess.is_internal()))
            }
            Err(e) => {
                debug!("[{}] listen through [{}] failed: {}", self.tag(), a.tag(), e);
                self.group.report_dial(Network::Udp, &a, false);
                Err(e)
            }
        }
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        Some(self)
    }
}

#[async_trait]
impl OutboundGroup for Handler {
    fn now(&self) -> String {
        match self.group.selected(Network::Tcp) {
            Some(a) => a.tag().to_string(),
            None => self
                .group
                .select(Network::Tcp)
                .0
                .map(|a| a.tag().to_string())
                .unwrap_or_default(),
        }
    }

    fn all(&self) -> Vec<String> {
        self.group
            .members()
            .iter()
            .map(|a| a.tag().to_string())
            .collect()
    }

    fn selected(&self, network: Network) -> Option<AnyOutboundHandler> {
        self.group
            .selected(network)
            .or_else(|| self.group.select(network).0)
    }

    async fn url_test(&self) -> io::Result<HashMap<String, ProbeResult>> {
        Ok(self.group.url_test().await)
    }

    fn update_check(&self) {
        self.group.update_check();
    }

    fn post_start(&self) {
        self.group.post_start();
    }

    fn close(&self) {
        self.group.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::history::History;
    use crate::proxy::{block, outbound_chain};

    #[tokio::test]
    async fn test_handler_reports_selection() {
        let history = Arc::new(HistoryStorage::new());
        let handler = Handler::new(
            "auto".to_string(),
            vec![
                Arc::new(block::Handler::new("a".to_string())),
                Arc::new(block::Handler::new("b".to_string())),
            ],
            &UrlTestOutboundSettings::default(),
            history.clone(),
        )
        .unwrap();
        assert_eq!(handler.now(), "a");
        assert_eq!(handler.network(), vec![Network::Tcp, Network::Udp]);

        history.store("b", History::success(20));
        handler.group().perform_update_check();
        assert_eq!(handler.now(), "b");

        let handler: AnyOutboundHandler = Arc::new(handler);
        assert_eq!(
            outbound_chain(&handler, Network::Tcp),
            vec!["auto".to_string(), "b".to_string()]
        );

        let err = handler.dial_tcp(&Session::default()).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
