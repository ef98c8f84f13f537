use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::proxy::{AnyOutboundDatagram, AnyStream, OutboundDatagram};
use crate::session::SocksAddr;

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "interrupted by group")
}

/// Tracks connections dialed through a group so they can be aborted when
/// the group switches members. Connections made by the core itself are
/// always aborted, inbound ones only if `interrupt_external` is set.
pub struct Interrupter {
    internal: Mutex<CancellationToken>,
    external: Mutex<CancellationToken>,
    interrupt_external: bool,
}

impl Interrupter {
    pub fn new(interrupt_external: bool) -> Self {
        Interrupter {
            internal: Mutex::new(CancellationToken::new()),
            external: Mutex::new(CancellationToken::new()),
            interrupt_external,
        }
    }

    fn token(&self, internal: bool) -> CancellationToken {
        if internal {
            self.internal.lock().clone()
        } else {
            self.external.lock().clone()
        }
    }

    pub fn interrupt(&self) {
        let old = std::mem::replace(&mut *self.internal.lock(), CancellationToken::new());
        old.cancel();
        if self.interrupt_external {
            let old = std::mem::replace(&mut *self.external.lock(), CancellationToken::new());
            old.cancel();
        }
    }

    pub fn wrap_stream(&self, stream: AnyStream, internal: bool) -> AnyStream {
        Box::new(InterruptStream::new(stream, self.token(internal)))
    }

    pub fn wrap_datagram(
        &self,
        dgram: AnyOutboundDatagram,
        internal: bool,
    ) -> AnyOutboundDatagram {
        Box::new(InterruptDatagram {
            inner: dgram,
            token: self.token(internal),
        })
    }
}

type Cancelled = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A stream which fails every operation once its token is cancelled.
pub struct InterruptStream {
    inner: AnyStream,
    cancelled: Mutex<Option<Cancelled>>,
}

impl InterruptStream {
    pub fn new(inner: AnyStream, token: CancellationToken) -> Self {
        let cancelled: Cancelled = Box::pin(async move { token.cancelled().await });
        InterruptStream {
            inner,
            cancelled: Mutex::new(Some(cancelled)),
        }
    }

    fn poll_interrupted(&mut self, cx: &mut Context<'_>) -> bool {
        let done = match self.cancelled.get_mut() {
            None => return true,
            Some(fut) => fut.as_mut().poll(cx).is_ready(),
        };
        if done {
            // A finished future must not be polled again.
            *self.cancelled.get_mut() = None;
        }
        done
    }
}

impl AsyncRead for InterruptStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.poll_interrupted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for InterruptStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.poll_interrupted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.poll_interrupted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct InterruptDatagram {
    inner: AnyOutboundDatagram,
    token: CancellationToken,
}

#[async_trait]
impl OutboundDatagram for InterruptDatagram {
    async fn send_to(&self, buf: &[u8], target: &SocksAddr) -> io::Result<usize> {
        tokio::select! {
            _ = self.token.cancelled() => Err(aborted()),
            r = self.inner.send_to(buf, target) => r,
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocksAddr)> {
        tokio::select! {
            _ = self.token.cancelled() => Err(aborted()),
            r = self.inner.recv_from(buf) => r,
        }
    }
}
