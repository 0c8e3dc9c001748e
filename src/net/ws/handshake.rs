//! WebSocket opening handshake, both roles.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::errors::ProtocolError;
use crate::net::http::{HttpRequest, HttpResponse, Method};

/// Concatenated with the client key before hashing, per RFC 6455 §1.3.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Fresh random 16-byte key, base64 encoded.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Upgrade request a client sends to open a WebSocket at `path`.
pub fn client_request(host: &str, port: u16, path: &str, key: &str, subprotocol: Option<&str>) -> HttpRequest {
    let mut req = HttpRequest::new(Method::Get, path);
    req.headers.insert("Host", format!("{host}:{port}"));
    req.headers.insert("Upgrade", "websocket");
    req.headers.insert("Connection", "Upgrade");
    req.headers.insert("Sec-WebSocket-Key", key);
    req.headers.insert("Sec-WebSocket-Version", "13");
    if let Some(proto) = subprotocol {
        req.headers.insert("Sec-WebSocket-Protocol", proto);
    }
    req
}

/// True when the request even attempts a WebSocket upgrade; used to pick
/// between plain dispatch and handshake validation.
pub fn is_upgrade_request(req: &HttpRequest) -> bool {
    req.headers.contains_token("Connection", "Upgrade")
        || req.headers.get("Upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Validate a client upgrade and return `(key, offered_subprotocol)`.
pub fn validate_upgrade_request(req: &HttpRequest) -> Result<(String, Option<String>), ProtocolError> {
    if req.method != Method::Get {
        return Err(ProtocolError::Handshake(format!(
            "upgrade must be GET, got {}",
            req.method
        )));
    }
    if !req.headers.contains_token("Connection", "Upgrade") {
        return Err(ProtocolError::Handshake("missing Connection: Upgrade".into()));
    }
    if !req
        .headers
        .get("Upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    {
        return Err(ProtocolError::Handshake("missing Upgrade: websocket".into()));
    }
    if req.headers.get("Sec-WebSocket-Version") != Some("13") {
        return Err(ProtocolError::Handshake("unsupported Sec-WebSocket-Version".into()));
    }
    let key = req
        .headers
        .get("Sec-WebSocket-Key")
        .ok_or_else(|| ProtocolError::Handshake("missing Sec-WebSocket-Key".into()))?;
    let decoded = BASE64
        .decode(key)
        .map_err(|_| ProtocolError::Handshake("Sec-WebSocket-Key is not base64".into()))?;
    if decoded.len() != 16 {
        return Err(ProtocolError::Handshake("Sec-WebSocket-Key must decode to 16 bytes".into()));
    }
    let subprotocol = req
        .headers
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    Ok((key.to_string(), subprotocol))
}

/// `101 Switching Protocols` answering a validated upgrade.
pub fn upgrade_response(key: &str, subprotocol: Option<&str>) -> HttpResponse {
    let mut resp = HttpResponse::new(101, "Switching Protocols");
    resp.headers.insert("Upgrade", "websocket");
    resp.headers.insert("Connection", "Upgrade");
    resp.headers.insert("Sec-WebSocket-Accept", accept_key(key));
    if let Some(proto) = subprotocol {
        resp.headers.insert("Sec-WebSocket-Protocol", proto);
    }
    resp
}

/// Client-side check of the server's handshake reply.
pub fn validate_upgrade_response(resp: &HttpResponse, key: &str) -> Result<(), ProtocolError> {
    if resp.status != 101 {
        return Err(ProtocolError::Handshake(format!(
            "expected 101, got {} {}",
            resp.status, resp.reason
        )));
    }
    let expected = accept_key(key);
    match resp.headers.get("Sec-WebSocket-Accept") {
        Some(got) if got == expected => Ok(()),
        Some(got) => Err(ProtocolError::Handshake(format!(
            "Sec-WebSocket-Accept mismatch: expected {expected}, got {got}"
        ))),
        None => Err(ProtocolError::Handshake("missing Sec-WebSocket-Accept".into())),
    }
}
