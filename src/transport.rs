//! Reusable byte-stream transports
//!
//! A [`Transport`] is one connected stream to a remote endpoint, plain or
//! TLS-wrapped, identified by a [`TransportKey`] so it can be parked in the
//! pool and handed out again. A pre-established stream (e.g. a local
//! maintenance socket that is already connected) wraps into the same type
//! through [`Transport::from_stream`] instead of a separate hierarchy.

use crate::config::HttpConfig;
use crate::error::{EngineError, Result, TransportErrorKind};
use async_trait::async_trait;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_native_tls::{TlsConnector, TlsStream};

/// Pool identity of a transport: where it is connected and how
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportKey {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl TransportKey {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }
}

impl std::fmt::Display for TransportKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}:{}",
            if self.secure { "https" } else { "http" },
            self.host,
            self.port
        )
    }
}

/// Object-safe alias for anything a transport can wrap
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Pre-established stream supplied by the caller (UNIX socket shim,
    /// in-memory test duplex)
    Preconnected(Box<dyn RawStream>),
}

/// One connected byte stream plus the identity it was opened for
pub struct Transport {
    stream: Stream,
    key: TransportKey,
    last_used: Instant,
}

impl Transport {
    fn new(stream: Stream, key: TransportKey) -> Self {
        Self {
            stream,
            key,
            last_used: Instant::now(),
        }
    }

    /// Wrap an already-connected stream under the given identity.
    ///
    /// The identity must match the URL the request will carry, the same
    /// way the original local-socket shim pinned host and port.
    pub fn from_stream(stream: Box<dyn RawStream>, key: TransportKey) -> Self {
        Self::new(Stream::Preconnected(stream), key)
    }

    pub fn key(&self) -> &TransportKey {
        &self.key
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.stream {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Stream::Preconnected(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.stream {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Stream::Preconnected(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.stream {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Stream::Preconnected(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.stream {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Stream::Preconnected(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.stream {
            Stream::Plain(_) => "plain",
            Stream::Tls(_) => "tls",
            Stream::Preconnected(_) => "preconnected",
        };
        f.debug_struct("Transport")
            .field("key", &self.key)
            .field("kind", &kind)
            .finish()
    }
}

/// Transport-opening capability.
///
/// Resolution, connect and handshake all happen inside `open`; the engine
/// awaits it concurrently with every other job, so a stalling host never
/// serializes unrelated work. Tests substitute their own implementation.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh connected transport for the given identity.
    ///
    /// `sni_host` overrides the name presented during the TLS handshake
    /// when the dialed host is not the logical one (virtual hosting).
    async fn open(
        &self,
        key: &TransportKey,
        sni_host: Option<&str>,
        config: &HttpConfig,
    ) -> Result<Transport>;
}

/// Production connector: DNS + TCP + optional TLS over native-tls
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn open(
        &self,
        key: &TransportKey,
        sni_host: Option<&str>,
        config: &HttpConfig,
    ) -> Result<Transport> {
        let deadline = config.connect_timeout();

        let addr = format!("{}:{}", key.host, key.port);
        let resolved = tokio::time::timeout(deadline, tokio::net::lookup_host(&addr))
            .await
            .map_err(|_| EngineError::timeout(format!("resolving {}", key.host)))?
            .map_err(|e| {
                EngineError::transport(
                    TransportErrorKind::DnsResolution,
                    format!("{}: {}", key.host, e),
                )
            })?
            .next()
            .ok_or_else(|| {
                EngineError::transport(
                    TransportErrorKind::DnsResolution,
                    format!("no address for {}", key.host),
                )
            })?;

        let tcp = tokio::time::timeout(deadline, TcpStream::connect(resolved))
            .await
            .map_err(|_| EngineError::timeout(format!("connecting to {}", key)))?
            .map_err(|e| {
                EngineError::transport(TransportErrorKind::Connect, format!("{}: {}", key, e))
            })?;
        tcp.set_nodelay(true).ok();

        if !key.secure {
            tracing::debug!(peer = %key, "opened plain transport");
            return Ok(Transport::new(Stream::Plain(tcp), key.clone()));
        }

        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .danger_accept_invalid_hostnames(config.accept_invalid_certs)
            .build()
            .map_err(|e| EngineError::transport(TransportErrorKind::Tls, e.to_string()))?;
        let connector = TlsConnector::from(tls);

        let server_name = sni_host.unwrap_or(&key.host);
        let stream = tokio::time::timeout(deadline, connector.connect(server_name, tcp))
            .await
            .map_err(|_| EngineError::timeout(format!("TLS handshake with {}", key)))?
            .map_err(|e| {
                EngineError::transport(TransportErrorKind::Tls, format!("{}: {}", key, e))
            })?;

        tracing::debug!(peer = %key, sni = server_name, "opened TLS transport");
        Ok(Transport::new(Stream::Tls(Box::new(stream)), key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_key_display() {
        let key = TransportKey::new("mirror.example", 443, true);
        assert_eq!(key.to_string(), "https://mirror.example:443");
        let key = TransportKey::new("localhost", 3142, false);
        assert_eq!(key.to_string(), "http://localhost:3142");
    }

    #[tokio::test]
    async fn test_preconnected_transport_round_trip() {
        let (client, mut server) = tokio::io::duplex(256);
        let key = TransportKey::new("localhost", 3142, false);
        let mut transport = Transport::from_stream(Box::new(client), key.clone());
        assert_eq!(transport.key(), &key);

        transport.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let key = TransportKey::new("127.0.0.1", port, false);
        let config = HttpConfig {
            connect_timeout: 2,
            ..HttpConfig::default()
        };
        let err = TcpConnector.open(&key, None, &config).await.unwrap_err();
        assert!(err.is_retryable(), "connect failure should be retryable: {err}");
    }
}
