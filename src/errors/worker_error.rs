//! Worker error taxonomy.
//!
//! Errors are values and recover locally at the layer that produced them:
//! a transport error closes its connection, a protocol error closes with a
//! 1002/400, a media error drops the offending packet and keeps the stage
//! alive. Only configuration errors are fatal, and only at startup.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal startup errors: bad YAML, missing model files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Connection-level failures: DNS, connect, read/write, TLS.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("resolve failure for {0}")]
    Resolve(String),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("TLS failure: {0}")]
    Tls(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("transport closed")]
    Closed,
}

/// Malformed wire input: HTTP, WebSocket framing, protoo JSON.
///
/// A protocol error is fatal for its connection (1002 close or HTTP 400)
/// but never for the process.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed HTTP: {0}")]
    Http(String),
    #[error("malformed WebSocket frame: {0}")]
    WebSocket(String),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("malformed signalling message: {0}")]
    Signalling(String),
}

/// Per-packet media failures; the stage drops the packet and continues.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("codec open failed: {0}")]
    CodecOpen(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("filter failed: {0}")]
    Filter(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("synthesis failed: {0}")]
    Synthesis(String),
}
