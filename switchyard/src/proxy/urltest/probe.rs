use std::io;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::trace;

use crate::common::http::{self, ProbeTarget};
use crate::proxy::AnyOutboundHandler;
use crate::session::{Network, Session};

fn probe_timeout() -> Duration {
    Duration::from_secs(*crate::option::URLTEST_TIMEOUT)
}

fn millis(d: Duration) -> u16 {
    d.as_millis().clamp(1, u16::MAX as u128) as u16
}

/// Measures the delay of `handler` to `target` in milliseconds.
pub async fn url_test(handler: &AnyOutboundHandler, target: &ProbeTarget) -> io::Result<u16> {
    match timeout(probe_timeout(), probe(handler, target)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "url test timeout")),
    }
}

async fn probe(handler: &AnyOutboundHandler, target: &ProbeTarget) -> io::Result<u16> {
    let sess = Session {
        network: Network::Tcp,
        destination: target.destination(),
        ..Default::default()
    };
    let start = Instant::now();
    let mut stream = handler.dial_tcp(&sess).await?;
    if target.tls {
        stream = http::connect_tls(stream, &target.host).await?;
    }
    http::head(&mut stream, target).await?;
    let first = start.elapsed();

    // The first request pays for the handshakes, a second one on the same
    // connection smooths that out.
    let start = Instant::now();
    let delay = match http::head(&mut stream, target).await {
        Ok(_) => (first + start.elapsed()) / 2,
        Err(e) => {
            trace!("[{}] follow-up request failed: {}", handler.tag(), e);
            first
        }
    };
    Ok(millis(delay))
}
