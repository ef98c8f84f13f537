use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::app::dns::{DomainStrategy, SyncDnsClient};
use crate::proxy::{dial_timeout, AnyStream};
use crate::session::{Session, SocksAddr};

async fn resolve(
    sess: &Session,
    dns_client: &SyncDnsClient,
    strategy: DomainStrategy,
) -> io::Result<Vec<SocketAddr>> {
    match &sess.destination {
        SocksAddr::Ip(addr) => Ok(vec![*addr]),
        SocksAddr::Domain(domain, port) => {
            let ips = if sess.destination_addresses.is_empty() {
                dns_client.lookup(domain, strategy).await?
            } else {
                sess.destination_addresses.clone()
            };
            Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, *port)).collect())
        }
    }
}

/// Connects to the session destination, trying resolved addresses in order.
pub async fn connect(
    sess: &Session,
    dns_client: &SyncDnsClient,
    strategy: DomainStrategy,
) -> io::Result<AnyStream> {
    let addrs = resolve(sess, dns_client, strategy).await?;
    let mut last_err = None;
    for addr in addrs {
        trace!("direct connecting {}", addr);
        match tokio::time::timeout(dial_timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                return Ok(Box::new(stream));
            }
            Ok(Err(e)) => {
                debug!("direct connect {} failed: {}", addr, e);
                last_err = Some(e);
            }
            Err(_) => {
                debug!("direct connect {} timed out", addr);
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect {} timed out", addr),
                ));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {}", &sess.destination),
        )
    }))
}
