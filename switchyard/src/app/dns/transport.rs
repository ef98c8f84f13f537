use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;
use trust_dns_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_proto::rr::rdata::{A, AAAA};
use trust_dns_proto::rr::{Name, RData, Record, RecordType};

use super::{DomainStrategy, FakeIpStore, TransportDialer};
use crate::option;
use crate::session::SocksAddr;

/// A DNS upstream able to answer wire-format queries.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Strategy used when the caller does not ask for one.
    fn strategy(&self) -> DomainStrategy {
        DomainStrategy::AsIs
    }

    fn is_fakeip(&self) -> bool {
        false
    }

    async fn exchange(&self, request: &Message) -> io::Result<Message>;

    fn close(&self) {}
}

pub(super) fn proto_err<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("dns message: {}", e))
}

fn fqdn(domain: &str) -> io::Result<Name> {
    let domain = if domain.ends_with('.') {
        domain.to_string()
    } else {
        format!("{}.", domain)
    };
    Name::from_ascii(domain).map_err(proto_err)
}

pub fn new_query(domain: &str, record_type: RecordType) -> io::Result<Message> {
    let mut msg = Message::new();
    msg.set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(fqdn(domain)?, record_type));
    Ok(msg)
}

/// An empty response to `request` with `code`.
pub fn reply(request: &Message, code: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    for q in request.queries() {
        msg.add_query(q.clone());
    }
    msg
}

fn reply_with_ips(request: &Message, ips: &[IpAddr], ttl: u32) -> Message {
    let mut msg = reply(request, ResponseCode::NoError);
    if let Some(query) = request.queries().first() {
        for ip in ips {
            let rdata = match (ip, query.query_type()) {
                (IpAddr::V4(ip), RecordType::A) => RData::A(A(*ip)),
                (IpAddr::V6(ip), RecordType::AAAA) => RData::AAAA(AAAA(*ip)),
                _ => continue,
            };
            msg.add_answer(Record::from_rdata(query.name().clone(), ttl, rdata));
        }
    }
    msg
}

/// Addresses and the smallest TTL found in the answer section.
pub fn answer_ips(msg: &Message) -> (Vec<IpAddr>, u32) {
    let mut ttl = u32::MAX;
    let mut ips = Vec::new();
    for record in msg.answers() {
        let ip = match record.data() {
            Some(RData::A(a)) => IpAddr::V4(a.0),
            Some(RData::AAAA(a)) => IpAddr::V6(a.0),
            _ => continue,
        };
        ttl = ttl.min(record.ttl());
        ips.push(ip);
    }
    if ips.is_empty() {
        ttl = 0;
    }
    (ips, ttl)
}

fn query_domain(request: &Message) -> io::Result<(String, RecordType)> {
    let query = request
        .queries()
        .first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty dns question"))?;
    let name = query.name().to_ascii();
    Ok((name.trim_end_matches('.').to_string(), query.query_type()))
}

async fn exchange_timeout(transport: &dyn DnsTransport, request: &Message) -> io::Result<Message> {
    let timeout = Duration::from_secs(*option::DNS_TIMEOUT);
    match tokio::time::timeout(timeout, transport.exchange(request)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("[{}] dns exchange timed out", transport.name()),
        )),
    }
}

/// Queries one record type through `transport`, returning the answer
/// addresses and their TTL.
pub async fn query_raw(
    transport: &dyn DnsTransport,
    domain: &str,
    record_type: RecordType,
) -> io::Result<(Vec<IpAddr>, u32)> {
    let request = new_query(domain, record_type)?;
    let response = exchange_timeout(transport, &request).await?;
    if response.response_code() != ResponseCode::NoError {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "[{}] lookup {} {}: {}",
                transport.name(),
                domain,
                record_type,
                response.response_code()
            ),
        ));
    }
    let (ips, ttl) = answer_ips(&response);
    let ips = ips
        .into_iter()
        .filter(|ip| match record_type {
            RecordType::A => ip.is_ipv4(),
            RecordType::AAAA => ip.is_ipv6(),
            _ => true,
        })
        .collect();
    Ok((ips, ttl))
}

pub(super) fn record_types(strategy: DomainStrategy) -> Vec<RecordType> {
    let mut types = Vec::with_capacity(2);
    if strategy.wants_ipv4() {
        types.push(RecordType::A);
    }
    if strategy.wants_ipv6() {
        types.push(RecordType::AAAA);
    }
    types
}

/// Merges per record type results, keeping the first error if nothing was
/// found at all.
pub(super) fn merge_results(
    domain: &str,
    strategy: DomainStrategy,
    results: Vec<io::Result<Vec<IpAddr>>>,
) -> io::Result<Vec<IpAddr>> {
    let mut ips = Vec::new();
    let mut first_err = None;
    for res in results {
        match res {
            Ok(v) => ips.extend(v),
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    let ips = strategy.sort(ips);
    if !ips.is_empty() {
        return Ok(ips);
    }
    Err(first_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no record for {}", domain))
    }))
}

/// Resolves `domain` straight through `transport`, without cache or rules.
pub async fn lookup_raw(
    transport: &dyn DnsTransport,
    domain: &str,
    strategy: DomainStrategy,
) -> io::Result<Vec<IpAddr>> {
    if let Ok(ip) = domain.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    let strategy = strategy.or(transport.strategy());
    let results = join_all(
        record_types(strategy)
            .into_iter()
            .map(|t| async move { query_raw(transport, domain, t).await.map(|(ips, _)| ips) }),
    )
    .await;
    merge_results(domain, strategy, results)
}

/// Answers from the host's resolver.
pub struct LocalTransport {
    pub name: String,
    pub strategy: DomainStrategy,
}

#[async_trait]
impl DnsTransport for LocalTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> DomainStrategy {
        self.strategy
    }

    async fn exchange(&self, request: &Message) -> io::Result<Message> {
        let (domain, record_type) = query_domain(request)?;
        if !matches!(record_type, RecordType::A | RecordType::AAAA) {
            return Ok(reply(request, ResponseCode::NotImp));
        }
        let ips: Vec<IpAddr> = match tokio::net::lookup_host((domain.as_str(), 0)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).collect(),
            Err(e) => {
                trace!("[{}] lookup {} failed: {}", &self.name, &domain, e);
                return Ok(reply(request, ResponseCode::NXDomain));
            }
        };
        Ok(reply_with_ips(request, &ips, *option::DNS_SYNTHETIC_TTL))
    }
}

/// Plain DNS over UDP.
pub struct UdpTransport {
    pub name: String,
    pub server: SocksAddr,
    pub strategy: DomainStrategy,
    pub dialer: TransportDialer,
}

#[async_trait]
impl DnsTransport for UdpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> DomainStrategy {
        self.strategy
    }

    async fn exchange(&self, request: &Message) -> io::Result<Message> {
        let bytes = request.to_vec().map_err(proto_err)?;
        let (socket, target) = self.dialer.listen_packet(&self.server).await?;
        socket.send_to(&bytes, &target).await?;
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, _) = socket.recv_from(&mut buf).await?;
            let response = match Message::from_vec(&buf[..n]) {
                Ok(msg) => msg,
                Err(e) => {
                    trace!("[{}] ignore malformed response: {}", &self.name, e);
                    continue;
                }
            };
            if response.id() == request.id() {
                return Ok(response);
            }
        }
    }
}

/// DNS over TCP with 2-byte length framing.
pub struct TcpTransport {
    pub name: String,
    pub server: SocksAddr,
    pub strategy: DomainStrategy,
    pub dialer: TransportDialer,
}

#[async_trait]
impl DnsTransport for TcpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> DomainStrategy {
        self.strategy
    }

    async fn exchange(&self, request: &Message) -> io::Result<Message> {
        let bytes = request.to_vec().map_err(proto_err)?;
        let len = u16::try_from(bytes.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "dns message too large"))?;
        let mut stream = self.dialer.dial_tcp(&self.server).await?;
        let mut frame = Vec::with_capacity(bytes.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&bytes);
        stream.write_all(&frame).await?;
        stream.flush().await?;
        let n = stream.read_u16().await? as usize;
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).await?;
        Message::from_vec(&buf).map_err(proto_err)
    }
}

/// Always answers with a fixed response code.
pub struct RcodeTransport {
    pub name: String,
    pub code: ResponseCode,
}

#[async_trait]
impl DnsTransport for RcodeTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exchange(&self, request: &Message) -> io::Result<Message> {
        Ok(reply(request, self.code))
    }
}

/// Answers address queries with addresses from the fake-ip range.
pub struct FakeIpTransport {
    pub name: String,
    pub store: Arc<FakeIpStore>,
}

#[async_trait]
impl DnsTransport for FakeIpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_fakeip(&self) -> bool {
        true
    }

    async fn exchange(&self, request: &Message) -> io::Result<Message> {
        let (domain, record_type) = query_domain(request)?;
        let ip = match record_type {
            RecordType::A => self.store.allocate(&domain, false),
            RecordType::AAAA => self.store.allocate(&domain, true),
            _ => None,
        };
        let ips: Vec<IpAddr> = ip.into_iter().collect();
        Ok(reply_with_ips(request, &ips, *option::DNS_SYNTHETIC_TTL))
    }
}

pub(super) fn rcode_from_str(s: &str) -> Option<ResponseCode> {
    match s {
        "success" => Some(ResponseCode::NoError),
        "format_error" => Some(ResponseCode::FormErr),
        "server_failure" => Some(ResponseCode::ServFail),
        "name_error" => Some(ResponseCode::NXDomain),
        "not_implemented" => Some(ResponseCode::NotImp),
        "refused" => Some(ResponseCode::Refused),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rcode_transport() {
        let t = RcodeTransport {
            name: "block".to_string(),
            code: ResponseCode::NXDomain,
        };
        let err = lookup_raw(&t, "example.com", DomainStrategy::AsIs)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("[block] lookup example.com"), "{}", err);

        let t = RcodeTransport {
            name: "empty".to_string(),
            code: ResponseCode::NoError,
        };
        let err = lookup_raw(&t, "example.com", DomainStrategy::AsIs)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_ip_literal_skips_transport() {
        let t = RcodeTransport {
            name: "refused".to_string(),
            code: ResponseCode::Refused,
        };
        let ips = lookup_raw(&t, "10.0.0.1", DomainStrategy::AsIs).await.unwrap();
        assert_eq!(ips, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_reply_with_ips() {
        let request = new_query("example.com", RecordType::A).unwrap();
        let v4: IpAddr = "1.2.3.4".parse().unwrap();
        let v6: IpAddr = "::1".parse().unwrap();
        let response = reply_with_ips(&request, &[v4, v6], 60);
        assert_eq!(response.id(), request.id());
        let (ips, ttl) = answer_ips(&response);
        assert_eq!(ips, vec![v4]);
        assert_eq!(ttl, 60);
    }
}
