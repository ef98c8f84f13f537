use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::proxy::interrupt::Interrupter;
use crate::proxy::{
    AnyOutboundDatagram, AnyOutboundHandler, AnyStream, OutboundGroup, OutboundHandler,
};
use crate::session::{Network, Session};

/// A group whose member is chosen by the user.
pub struct Handler {
    tag: String,
    actors: Vec<AnyOutboundHandler>,
    selected: AtomicUsize,
    interrupter: Interrupter,
}

impl Handler {
    pub fn new(
        tag: String,
        actors: Vec<AnyOutboundHandler>,
        default: Option<&str>,
        interrupt_external: bool,
    ) -> Result<Self> {
        if actors.is_empty() {
            return Err(anyhow!("missing member outbounds"));
        }
        let selected = match default {
            Some(d) => actors
                .iter()
                .position(|a| a.tag() == d)
                .ok_or_else(|| anyhow!("default outbound not found: {}", d))?,
            None => 0,
        };
        Ok(Handler {
            tag,
            actors,
            selected: AtomicUsize::new(selected),
            interrupter: Interrupter::new(interrupt_external),
        })
    }

    fn current(&self) -> &AnyOutboundHandler {
        &self.actors[self.selected.load(Ordering::Relaxed)]
    }

    /// Switches to the member tagged `tag`. Returns false if there is no such
    /// member.
    pub fn select_outbound(&self, tag: &str) -> bool {
        let idx = match self.actors.iter().position(|a| a.tag() == tag) {
            Some(idx) => idx,
            None => return false,
        };
        if self.selected.swap(idx, Ordering::Relaxed) != idx {
            info!("[{}] selected [{}]", &self.tag, tag);
            self.interrupter.interrupt();
        }
        true
    }
}

#[async_trait]
impl OutboundHandler for Handler {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn network(&self) -> Vec<Network> {
        self.current().network()
    }

    async fn dial_tcp(&self, sess: &Session) -> io::Result<AnyStream> {
        let a = self.current();
        debug!("[{}] dial through [{}]", &self.tag, a.tag());
        let stream = a.dial_tcp(sess).await?;
        Ok(self.interrupter.wrap_stream(stream, sess.is_internal()))
    }

    async fn listen_packet(&self, sess: &Session) -> io::Result<AnyOutboundDatagram> {
        let a = self.current();
        debug!("[{}] listen through [{}]", &self.tag, a.tag());
        let dgram = a.listen_packet(sess).await?;
        Ok(self.interrupter.wrap_datagram(dgram, sess.is_internal()))
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        Some(self)
    }
}

#[async_trait]
impl OutboundGroup for Handler {
    fn now(&self) -> String {
        self.current().tag().to_string()
    }

    fn all(&self) -> Vec<String> {
        self.actors.iter().map(|a| a.tag().to_string()).collect()
    }

    fn selected(&self, _network: Network) -> Option<AnyOutboundHandler> {
        Some(self.current().clone())
    }
}
