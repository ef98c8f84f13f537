use std::io;

use async_trait::async_trait;

use crate::app::dns::{DomainStrategy, SyncDnsClient};
use crate::proxy::{AnyOutboundDatagram, AnyStream, OutboundHandler};
use crate::session::{Network, Session};

pub mod datagram;
pub mod stream;

/// Sends traffic straight to the destination from this host.
pub struct Handler {
    pub tag: String,
    pub dns_client: SyncDnsClient,
    pub strategy: DomainStrategy,
}

impl Handler {
    pub fn new(tag: String, dns_client: SyncDnsClient, strategy: DomainStrategy) -> Self {
        Handler {
            tag,
            dns_client,
            strategy,
        }
    }
}

#[async_trait]
impl OutboundHandler for Handler {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn network(&self) -> Vec<Network> {
        vec![Network::Tcp, Network::Udp]
    }

    async fn dial_tcp(&self, sess: &Session) -> io::Result<AnyStream> {
        stream::connect(sess, &self.dns_client, self.strategy).await
    }

    async fn listen_packet(&self, sess: &Session) -> io::Result<AnyOutboundDatagram> {
        let dgram =
            datagram::Datagram::bind(sess, self.dns_client.clone(), self.strategy).await?;
        Ok(Box::new(dgram))
    }
}
