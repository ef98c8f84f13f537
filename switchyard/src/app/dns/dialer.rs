use std::io;
use std::sync::Arc;

use tracing::trace;

use super::{lookup_raw, system_lookup, DnsTransport, DomainStrategy};
use crate::proxy::{AnyOutboundDatagram, AnyOutboundHandler, AnyStream};
use crate::session::{Network, Session, SocksAddr};

/// How a DNS transport reaches its server: through a detour outbound, after
/// optionally resolving the server name with another transport.
pub struct TransportDialer {
    detour: AnyOutboundHandler,
    resolver: Option<(Arc<dyn DnsTransport>, DomainStrategy)>,
}

impl TransportDialer {
    pub fn new(
        detour: AnyOutboundHandler,
        resolver: Option<(Arc<dyn DnsTransport>, DomainStrategy)>,
    ) -> Self {
        TransportDialer { detour, resolver }
    }

    async fn resolve(&self, server: &SocksAddr) -> io::Result<Vec<SocksAddr>> {
        let (domain, port) = match server {
            SocksAddr::Ip(_) => return Ok(vec![server.clone()]),
            SocksAddr::Domain(domain, port) => (domain, *port),
        };
        let ips = match &self.resolver {
            Some((resolver, strategy)) => {
                trace!("resolve dns server {} via [{}]", domain, resolver.name());
                lookup_raw(resolver.as_ref(), domain, *strategy).await?
            }
            None => system_lookup(domain, DomainStrategy::AsIs).await?,
        };
        Ok(ips.into_iter().map(|ip| SocksAddr::from((ip, port))).collect())
    }

    fn session(network: Network, destination: SocksAddr) -> Session {
        Session {
            network,
            destination,
            ..Default::default()
        }
    }

    pub async fn dial_tcp(&self, server: &SocksAddr) -> io::Result<AnyStream> {
        let mut last_err = None;
        for addr in self.resolve(server).await? {
            let sess = Self::session(Network::Tcp, addr);
            match self.detour.dial_tcp(&sess).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no address for {}", server))
        }))
    }

    /// Opens a datagram socket through the detour, along with the resolved
    /// server address to send to.
    pub async fn listen_packet(
        &self,
        server: &SocksAddr,
    ) -> io::Result<(AnyOutboundDatagram, SocksAddr)> {
        let addr = self.resolve(server).await?.into_iter().next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no address for {}", server))
        })?;
        let sess = Self::session(Network::Udp, addr.clone());
        let socket = self.detour.listen_packet(&sess).await?;
        Ok((socket, addr))
    }
}
