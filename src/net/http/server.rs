//! Local HTTP/WS control endpoint.
//!
//! One listener serves plain HTTP handlers (health checks such as
//! `POST /echo`) and WebSocket upgrades on the same port. Each accepted
//! connection runs in its own task, registered in a session map keyed by
//! the remote endpoint and removed when the connection ends.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::errors::TransportError;
use crate::net::tls::Transport;
use crate::net::ws::session::{self, Role, WsEvent};
use crate::net::ws::handshake;
use crate::signal::message::ProtooMessage;

use super::parser::RequestParser;
use super::types::{HttpRequest, HttpResponse, Method};

/// Synchronous request handler; panics are caught and answered with a 500.
pub type Handler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

#[derive(Default)]
struct HandlerTable {
    routes: Vec<(Method, String, Handler)>,
}

impl HandlerTable {
    /// Exact path for the method first, then the method's `/` fallback,
    /// then the `/` handler of any method.
    fn lookup(&self, method: Method, path: &str) -> Option<&Handler> {
        self.routes
            .iter()
            .find(|(m, p, _)| *m == method && p == path)
            .or_else(|| self.routes.iter().find(|(m, p, _)| *m == method && p == "/"))
            .or_else(|| self.routes.iter().find(|(_, p, _)| p == "/"))
            .map(|(_, _, h)| h)
    }
}

/// The worker's control listener.
pub struct ControlServer {
    handlers: HandlerTable,
}

impl Default for ControlServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlServer {
    pub fn new() -> Self {
        let mut server = Self {
            handlers: HandlerTable::default(),
        };
        server.add_handler(Method::Post, "/echo", Arc::new(echo_handler));
        server
    }

    pub fn add_handler(&mut self, method: Method, path: &str, handler: Handler) {
        self.handlers.routes.push((method, path.to_string(), handler));
    }

    /// Bind and serve until the listener task is dropped. Returns the bound
    /// address, letting callers bind port 0 in tests.
    pub async fn spawn(self, bind: &str) -> Result<std::net::SocketAddr, TransportError> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "control server listening");

        let handlers = Arc::new(self.handlers);
        let sessions: Arc<Mutex<HashMap<String, ()>>> = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let endpoint = peer.to_string();
                debug!(%endpoint, "connection accepted");
                sessions.lock().insert(endpoint.clone(), ());
                let handlers = handlers.clone();
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_connection(stream, &handlers).await {
                        debug!(%endpoint, error = %e, "connection ended with error");
                    }
                    sessions.lock().remove(&endpoint);
                });
            }
        });
        Ok(addr)
    }
}

/// POST /echo: the body comes straight back. Health checks depend on it.
fn echo_handler(req: &HttpRequest) -> HttpResponse {
    debug!(len = req.body.len(), "echo request");
    HttpResponse::ok(req.body.clone())
}

async fn run_connection(
    mut stream: TcpStream,
    handlers: &HandlerTable,
) -> Result<(), TransportError> {
    let mut parser = RequestParser::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let requests = match parser.feed(&buf[..n]) {
            Ok(requests) => requests,
            Err(e) => {
                // Malformed HTTP closes the connection after a 400.
                let resp = HttpResponse::bad_request(&e.to_string());
                stream.write_all(&resp.to_bytes()).await?;
                return Ok(());
            }
        };
        for request in requests {
            if handshake::is_upgrade_request(&request) {
                return upgrade_connection(stream, request, parser).await;
            }
            let close = request.wants_close();
            let response = dispatch(handlers, &request);
            stream.write_all(&response.to_bytes()).await?;
            stream.flush().await?;
            if close {
                return Ok(());
            }
        }
    }
}

fn dispatch(handlers: &HandlerTable, request: &HttpRequest) -> HttpResponse {
    let Some(handler) = handlers.lookup(request.method, &request.path) else {
        return HttpResponse::not_found();
    };
    // A panicking handler must not unwind into the connection task.
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(request))) {
        Ok(response) => response,
        Err(_) => {
            warn!(path = %request.path, "handler panicked");
            HttpResponse::internal_error()
        }
    }
}

/// Complete the WebSocket handshake and run the control-plane session.
async fn upgrade_connection(
    mut stream: TcpStream,
    request: HttpRequest,
    mut parser: RequestParser,
) -> Result<(), TransportError> {
    let (key, subprotocol) = match handshake::validate_upgrade_request(&request) {
        Ok(pair) => pair,
        Err(e) => {
            let resp = HttpResponse::bad_request(&e.to_string());
            stream.write_all(&resp.to_bytes()).await?;
            return Ok(());
        }
    };
    let response = handshake::upgrade_response(&key, subprotocol.as_deref());
    stream.write_all(&response.to_bytes()).await?;
    stream.flush().await?;
    info!(path = %request.path, subprotocol = ?subprotocol, "websocket upgrade accepted");

    let leftover = parser.take_remaining();
    let (handle, mut events) = session::spawn(Transport::Plain(stream), leftover, Role::Server);

    // Control-plane behavior: answer protoo requests (echo liveness probes
    // in particular) with an ok response carrying the request data back.
    while let Some(event) = events.recv().await {
        match event {
            WsEvent::Text(text) => match ProtooMessage::parse(&text) {
                Ok(ProtooMessage::Request { id, method, data }) => {
                    debug!(id, %method, "control request");
                    handle.send_text(ProtooMessage::ok_response(id, data).to_json().to_string());
                }
                Ok(ProtooMessage::Notification { method, .. }) => {
                    debug!(%method, "control notification ignored");
                }
                Ok(ProtooMessage::Response { .. }) => {
                    debug!("unexpected response on control socket");
                }
                Err(e) => {
                    debug!(error = %e, "non-protoo text on control socket");
                }
            },
            WsEvent::Binary(data) => {
                debug!(len = data.len(), "binary frame on control socket ignored");
            }
            WsEvent::Closed { code, reason } => {
                debug!(code, %reason, "control websocket closed");
                break;
            }
        }
    }
    Ok(())
}
