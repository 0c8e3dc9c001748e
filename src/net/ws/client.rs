//! Outbound WebSocket connections.
//!
//! `connect` runs the whole opening sequence (resolve, TCP, optional TLS,
//! HTTP upgrade, accept-key validation) and hands back a running session.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::{ProtocolError, TransportError};
use crate::net::http::ResponseParser;
use crate::net::tls::Connector;

use super::handshake;
use super::session::{self, Role, WsEvent, WsHandle};

#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub enable_tls: bool,
    pub subprotocol: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WsConnectError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Open a WebSocket towards `cfg` and spawn its session task.
pub async fn connect(
    cfg: &WsClientConfig,
) -> Result<(WsHandle, mpsc::UnboundedReceiver<WsEvent>), WsConnectError> {
    let mut connector = Connector::new();
    let key = handshake::generate_key();
    let request = handshake::client_request(
        &cfg.host,
        cfg.port,
        &cfg.path,
        &key,
        cfg.subprotocol.as_deref(),
    );
    // The upgrade request rides the connector's pending buffer so it is
    // written the moment the transport reaches Ready.
    connector.queue_write(request.to_bytes());
    let mut transport = connector
        .connect(&cfg.host, cfg.port, cfg.enable_tls)
        .await?;

    // Read until the handshake reply is complete.
    let mut parser = ResponseParser::new();
    let mut buf = [0u8; 8 * 1024];
    let response = loop {
        let n = transport.read(&mut buf).await.map_err(TransportError::Io)?;
        if n == 0 {
            return Err(TransportError::Closed.into());
        }
        let mut responses = parser.feed(&buf[..n])?;
        if let Some(response) = responses.pop() {
            break response;
        }
    };

    if let Err(e) = handshake::validate_upgrade_response(&response, &key) {
        let _ = transport.shutdown().await;
        return Err(e.into());
    }
    debug!(host = %cfg.host, port = cfg.port, path = %cfg.path, "websocket handshake complete");

    let leftover = parser.take_remaining();
    let (handle, events) = session::spawn(transport, leftover, Role::Client);
    info!(host = %cfg.host, port = cfg.port, "websocket client connected");
    Ok((handle, events))
}
