//! Outbound transport with optional TLS.
//!
//! The connector keeps an explicit handshake state and a pending-write
//! buffer: application payloads handed over before the transport reaches
//! `Ready` are queued and flushed, in order, once the handshake completes.
//! rustls provides the record layer; the state machine here preserves the
//! connection lifecycle the rest of the stack observes.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::TransportError;

/// Established byte stream, plain or encrypted.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connection lifecycle as the owner observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    TcpConnecting,
    TlsHandshake,
    Ready,
}

/// Builds a [`Transport`], buffering application writes issued early.
pub struct Connector {
    state: HandshakeState,
    pending: Vec<Vec<u8>>,
}

impl Default for Connector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Queue an application payload. Before `Ready` it is held; the
    /// connect path flushes queued payloads in order once the handshake
    /// completes.
    pub fn queue_write(&mut self, data: Vec<u8>) {
        self.pending.push(data);
    }

    /// Resolve, connect, optionally run the TLS handshake, then flush any
    /// writes queued while the handshake was in flight.
    pub async fn connect(
        &mut self,
        host: &str,
        port: u16,
        tls: bool,
    ) -> Result<Transport, TransportError> {
        self.state = HandshakeState::TcpConnecting;
        let addr = format!("{host}:{port}");
        // Resolution failures and refused connections are distinct errors;
        // resolve explicitly so the caller can tell them apart.
        let resolved = tokio::net::lookup_host(addr.as_str())
            .await
            .ok()
            .and_then(|mut addrs| addrs.next());
        let target = match resolved {
            Some(t) => t,
            None => {
                self.state = HandshakeState::Idle;
                return Err(TransportError::Resolve(addr));
            }
        };
        let tcp = match TcpStream::connect(target).await {
            Ok(s) => s,
            Err(e) => {
                self.state = HandshakeState::Idle;
                return Err(TransportError::Connect { addr, source: e });
            }
        };
        tcp.set_nodelay(true).ok();

        let mut transport = if tls {
            self.state = HandshakeState::TlsHandshake;
            let config = client_tls_config();
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|e| TransportError::Tls(format!("invalid server name {host:?}: {e}")))?;
            let connector = TlsConnector::from(config);
            let stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            Transport::Tls(Box::new(stream))
        } else {
            Transport::Plain(tcp)
        };

        self.state = HandshakeState::Ready;
        for chunk in self.pending.drain(..) {
            transport.write_all(&chunk).await?;
        }
        transport.flush().await?;
        debug!(%addr, tls, "transport ready");
        Ok(transport)
    }
}

fn client_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}
