use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::app::history::ProbeResult;
use crate::session::{Network, Session, SocksAddr};

pub mod block;
pub mod direct;
pub mod interrupt;
pub mod select;
pub mod urltest;

pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<S> ProxyStream for S where S: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

pub type AnyStream = Box<dyn ProxyStream>;

/// An unconnected datagram socket obtained from an outbound.
#[async_trait]
pub trait OutboundDatagram: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: &SocksAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocksAddr)>;
}

pub type AnyOutboundDatagram = Box<dyn OutboundDatagram>;

/// A named, dialable network path.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    fn tag(&self) -> &str;

    /// Transports this outbound can carry.
    fn network(&self) -> Vec<Network>;

    async fn dial_tcp(&self, sess: &Session) -> io::Result<AnyStream>;

    async fn listen_packet(&self, sess: &Session) -> io::Result<AnyOutboundDatagram>;

    /// Returns the group view when this outbound delegates to members.
    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        None
    }
}

pub type AnyOutboundHandler = Arc<dyn OutboundHandler>;

/// An outbound that forwards to one of its member outbounds.
#[async_trait]
pub trait OutboundGroup: Send + Sync {
    /// Tag of the member currently used for TCP.
    fn now(&self) -> String;

    /// Tags of all members, in declaration order.
    fn all(&self) -> Vec<String>;

    /// The member a connection of `network` would go through right now.
    fn selected(&self, network: Network) -> Option<AnyOutboundHandler>;

    async fn url_test(&self) -> io::Result<HashMap<String, ProbeResult>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "url test is not supported by this group",
        ))
    }

    /// Asks the group to re-probe members whose results went stale.
    fn update_check(&self) {}

    fn post_start(&self) {}

    fn close(&self) {}
}

pub fn supports(handler: &AnyOutboundHandler, network: Network) -> bool {
    handler.network().contains(&network)
}

/// Follows group selections down to the outbound which actually carries the
/// traffic.
pub fn real_outbound(handler: &AnyOutboundHandler, network: Network) -> AnyOutboundHandler {
    let mut current = handler.clone();
    loop {
        let next = match current.as_group().and_then(|g| g.selected(network)) {
            Some(next) => next,
            None => return current,
        };
        current = next;
    }
}

pub fn real_tag(handler: &AnyOutboundHandler) -> String {
    real_outbound(handler, Network::Tcp).tag().to_string()
}

/// Tags from `handler` down through every nested group selection.
pub fn outbound_chain(handler: &AnyOutboundHandler, network: Network) -> Vec<String> {
    let mut chain = vec![handler.tag().to_string()];
    let mut current = handler.clone();
    while let Some(next) = current.as_group().and_then(|g| g.selected(network)) {
        chain.push(next.tag().to_string());
        current = next;
    }
    chain
}

pub(crate) fn dial_timeout() -> Duration {
    Duration::from_secs(*crate::option::OUTBOUND_DIAL_TIMEOUT)
}
