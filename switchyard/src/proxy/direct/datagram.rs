use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::app::dns::{DomainStrategy, SyncDnsClient};
use crate::proxy::OutboundDatagram;
use crate::session::{Session, SocksAddr};

pub struct Datagram {
    socket: UdpSocket,
    dns_client: SyncDnsClient,
    strategy: DomainStrategy,
}

impl Datagram {
    pub async fn bind(
        sess: &Session,
        dns_client: SyncDnsClient,
        strategy: DomainStrategy,
    ) -> io::Result<Self> {
        let bind_addr = match sess.destination.ip() {
            Some(IpAddr::V6(_)) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
            _ if strategy == DomainStrategy::Ipv6Only => {
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
            }
            _ => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        trace!("direct datagram bound on {}", socket.local_addr()?);
        Ok(Datagram {
            socket,
            dns_client,
            strategy,
        })
    }

    async fn resolve(&self, target: &SocksAddr) -> io::Result<SocketAddr> {
        match target {
            SocksAddr::Ip(addr) => Ok(*addr),
            SocksAddr::Domain(domain, port) => {
                let local_is_v6 = self.socket.local_addr()?.is_ipv6();
                let ips = self.dns_client.lookup(domain, self.strategy).await?;
                // A v4 socket cannot reach v6 destinations.
                ips.into_iter()
                    .find(|ip| local_is_v6 || ip.is_ipv4())
                    .map(|ip| SocketAddr::new(ip, *port))
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::AddrNotAvailable,
                            format!("no usable address for {}", domain),
                        )
                    })
            }
        }
    }
}

#[async_trait]
impl OutboundDatagram for Datagram {
    async fn send_to(&self, buf: &[u8], target: &SocksAddr) -> io::Result<usize> {
        let addr = self.resolve(target).await?;
        self.socket.send_to(buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocksAddr)> {
        let (n, addr) = self.socket.recv_from(buf).await?;
        Ok((n, SocksAddr::Ip(addr)))
    }
}
