#![allow(dead_code)]
//! Shared helpers for the integration tests: scripted outbounds and a local
//! DNS responder.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use trust_dns_proto::op::{Message, MessageType, ResponseCode};
use trust_dns_proto::rr::rdata::{A, AAAA};
use trust_dns_proto::rr::{RData, Record, RecordType};

use switchyard::proxy::{AnyOutboundDatagram, AnyStream, OutboundHandler};
use switchyard::session::{Network, Session};

/// An outbound which answers HTTP requests itself after a fixed delay, or
/// refuses every dial while failing.
pub struct MockOutbound {
    tag: String,
    delay: Duration,
    failing: AtomicBool,
    dials: AtomicUsize,
}

impl MockOutbound {
    pub fn new(tag: &str, delay_ms: u64) -> Arc<Self> {
        Arc::new(MockOutbound {
            tag: tag.to_string(),
            delay: Duration::from_millis(delay_ms),
            failing: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn failing(tag: &str) -> Arc<Self> {
        let m = Self::new(tag, 0);
        m.set_failing(true);
        m
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboundHandler for MockOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn network(&self) -> Vec<Network> {
        vec![Network::Tcp]
    }

    async fn dial_tcp(&self, _sess: &Session) -> io::Result<AnyStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} is down", &self.tag),
            ));
        }
        let (client, mut server) = tokio::io::duplex(4096);
        let delay = self.delay;
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match server.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => (),
                }
                tokio::time::sleep(delay).await;
                let resp = b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n";
                if server.write_all(resp).await.is_err() {
                    return;
                }
            }
        });
        Ok(Box::new(client))
    }

    async fn listen_packet(&self, _sess: &Session) -> io::Result<AnyOutboundDatagram> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "tcp only"))
    }
}

/// A UDP DNS server answering from `records`, with NXDOMAIN for anything
/// else. Returns its address and a counter of queries received.
pub async fn spawn_dns_server(
    records: HashMap<&'static str, Vec<IpAddr>>,
) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));
    let counter = queries.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(_) => return,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let request = match Message::from_vec(&buf[..n]) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let response = answer(&request, &records);
            let _ = socket.send_to(&response.to_vec().unwrap(), peer).await;
        }
    });
    (addr, queries)
}

fn answer(request: &Message, records: &HashMap<&'static str, Vec<IpAddr>>) -> Message {
    let mut msg = Message::new();
    msg.set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true);
    let query = match request.queries().first() {
        Some(q) => q.clone(),
        None => return msg,
    };
    msg.add_query(query.clone());
    let name = query.name().to_ascii();
    let ips = match records.get(name.trim_end_matches('.')) {
        Some(ips) => ips,
        None => {
            msg.set_response_code(ResponseCode::NXDomain);
            return msg;
        }
    };
    for ip in ips {
        let rdata = match (ip, query.query_type()) {
            (IpAddr::V4(ip), RecordType::A) => RData::A(A(*ip)),
            (IpAddr::V6(ip), RecordType::AAAA) => RData::AAAA(AAAA(*ip)),
            _ => continue,
        };
        msg.add_answer(Record::from_rdata(query.name().clone(), 300, rdata));
    }
    msg
}

/// Polls `f` until it holds, failing the test after a few seconds.
pub async fn wait_until<F: Fn() -> bool>(f: F) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// A TCP server answering every `HEAD` on a keep-alive connection with 204.
/// Returns its address and a counter of accepted connections.
pub async fn spawn_http_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => return,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => (),
                    }
                    let resp = b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n";
                    if stream.write_all(resp).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (addr, accepted)
}
