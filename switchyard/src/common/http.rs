//! Just enough HTTP/1.1 to time a `HEAD` request over an outbound stream.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::proxy::AnyStream;
use crate::session::SocksAddr;

const MAX_HEADER_SIZE: usize = 16 * 1024;

/// A parsed probe URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub tls: bool,
}

impl ProbeTarget {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let url = Url::parse(s).map_err(|e| anyhow::anyhow!("invalid url {}: {}", s, e))?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            scheme => return Err(anyhow::anyhow!("unsupported url scheme: {}", scheme)),
        };
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("missing host in url: {}", s))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("missing port in url: {}", s))?;
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(ProbeTarget {
            host,
            port,
            path,
            tls,
        })
    }

    pub fn destination(&self) -> SocksAddr {
        SocksAddr::from((self.host.as_str(), self.port))
    }

    fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match (self.tls, self.port) {
            (false, 80) | (true, 443) => host,
            _ => format!("{}:{}", host, self.port),
        }
    }
}

/// Sends a `HEAD` request on a keep-alive connection and reads the response
/// head. Returns the status code.
pub async fn head(stream: &mut AnyStream, target: &ProbeTarget) -> io::Result<u16> {
    let request = format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: switchyard\r\nAccept: */*\r\nConnection: keep-alive\r\n\r\n",
        &target.path,
        target.host_header()
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response header too large",
            ));
        }
    }
    parse_status(&buf)
}

fn parse_status(buf: &[u8]) -> io::Result<u16> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "invalid http response");
    let line_end = buf
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(invalid)?;
    let line = std::str::from_utf8(&buf[..line_end]).map_err(|_| invalid())?;
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some(v) if v.starts_with("HTTP/1.") => {}
        _ => return Err(invalid()),
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(invalid)
}

#[cfg(feature = "rustls-tls")]
pub async fn connect_tls(stream: AnyStream, server_name: &str) -> io::Result<AnyStream> {
    use std::sync::Arc;

    use tokio_rustls::rustls::{self, pki_types::ServerName};

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let tls = connector.connect(name, stream).await?;
    Ok(Box::new(tls))
}

#[cfg(not(feature = "rustls-tls"))]
pub async fn connect_tls(_stream: AnyStream, _server_name: &str) -> io::Result<AnyStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "https probe targets need the rustls-tls feature",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let t = ProbeTarget::parse("https://www.gstatic.com/generate_204").unwrap();
        assert_eq!(
            t,
            ProbeTarget {
                host: "www.gstatic.com".to_string(),
                port: 443,
                path: "/generate_204".to_string(),
                tls: true,
            }
        );
        assert_eq!(t.host_header(), "www.gstatic.com");

        let t = ProbeTarget::parse("http://127.0.0.1:8080/ping?x=1").unwrap();
        assert_eq!(t.path, "/ping?x=1");
        assert_eq!(t.host_header(), "127.0.0.1:8080");
        assert_eq!(t.destination(), SocksAddr::from(("127.0.0.1", 8080)));

        assert!(ProbeTarget::parse("ftp://example.com").is_err());
        assert!(ProbeTarget::parse("not a url").is_err());
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap(), 204);
        assert_eq!(parse_status(b"HTTP/1.0 301 Moved\r\nLocation: x\r\n\r\n").unwrap(), 301);
        assert!(parse_status(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_head_keep_alive() {
        let (client, mut server) = tokio::io::duplex(4096);
        let target = ProbeTarget::parse("http://example.com/generate_204").unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            for _ in 0..2 {
                let n = server.read(&mut buf).await.unwrap();
                assert!(buf[..n].starts_with(b"HEAD /generate_204 HTTP/1.1\r\n"));
                server
                    .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                    .await
                    .unwrap();
            }
        });
        let mut stream: AnyStream = Box::new(client);
        assert_eq!(head(&mut stream, &target).await.unwrap(), 204);
        assert_eq!(head(&mut stream, &target).await.unwrap(), 204);
    }
}
