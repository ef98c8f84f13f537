use std::io;

use async_trait::async_trait;

use crate::proxy::{AnyOutboundDatagram, AnyStream, OutboundHandler};
use crate::session::{Network, Session};

/// Refuses every connection.
pub struct Handler {
    tag: String,
}

impl Handler {
    pub fn new(tag: String) -> Self {
        Handler { tag }
    }
}

fn blocked() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "blocked")
}

#[async_trait]
impl OutboundHandler for Handler {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn network(&self) -> Vec<Network> {
        vec![Network::Tcp, Network::Udp]
    }

    async fn dial_tcp(&self, _sess: &Session) -> io::Result<AnyStream> {
        Err(blocked())
    }

    async fn listen_packet(&self, _sess: &Session) -> io::Result<AnyOutboundDatagram> {
        Err(blocked())
    }
}
