//! Signalling client: a protoo layer over the WebSocket client.
//!
//! The client runs in its own task and talks to its owner through two
//! channels: commands in (connect, request, notification) and
//! [`SignalEvent`]s out. Incoming text frames are classified by their
//! protoo tag; response ids are correlated against the outstanding-id set,
//! and a response nobody is waiting for is logged and otherwise ignored.

use std::collections::HashSet;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::net::ws::client::{self as ws_client, WsClientConfig};
use crate::net::ws::session::{WsEvent, WsHandle};

use super::message::{ProtooMessage, RequestIdAllocator};

/// Subprotocol offered on the signalling socket.
pub const PROTOO_SUBPROTOCOL: &str = "protoo";

#[derive(Debug)]
pub enum SignalEvent {
    Connected,
    Response(String),
    Notification(String),
    Closed { code: u16, reason: String },
}

#[derive(Debug)]
enum Command {
    Connect,
    Request { method: String, data: Value },
    Notify { method: String, data: Value },
}

/// Owner-side handle; the connection state machine lives in the task.
#[derive(Debug, Clone)]
pub struct ProtooClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ProtooClient {
    /// Spawn the client task. Events arrive on the returned receiver; no
    /// connection attempt is made until [`ProtooClient::async_connect`].
    pub fn spawn(cfg: WsClientConfig) -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_client(cfg, cmd_rx, event_tx));
        (Self { cmd_tx }, event_rx)
    }

    /// Ask the task to connect if it is not already connected. Idempotent;
    /// the owner throttles how often it calls this.
    pub fn async_connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect);
    }

    /// Send a request; the id is allocated inside the task.
    pub fn request(&self, method: &str, data: Value) {
        let _ = self.cmd_tx.send(Command::Request {
            method: method.to_string(),
            data,
        });
    }

    pub fn notify(&self, method: &str, data: Value) {
        let _ = self.cmd_tx.send(Command::Notify {
            method: method.to_string(),
            data,
        });
    }
}

struct ClientState {
    conn: Option<WsHandle>,
    ids: RequestIdAllocator,
    outstanding: HashSet<u64>,
}

async fn run_client(
    cfg: WsClientConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<SignalEvent>,
) {
    let mut state = ClientState {
        conn: None,
        ids: RequestIdAllocator::new(),
        outstanding: HashSet::new(),
    };
    let mut ws_rx: Option<mpsc::UnboundedReceiver<WsEvent>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => return,
                Some(Command::Connect) => {
                    if state.conn.is_some() {
                        continue;
                    }
                    match ws_client::connect(&cfg).await {
                        Ok((handle, events)) => {
                            state.conn = Some(handle);
                            ws_rx = Some(events);
                            let _ = event_tx.send(SignalEvent::Connected);
                        }
                        Err(e) => {
                            warn!(host = %cfg.host, port = cfg.port, error = %e, "signalling connect failed");
                            let _ = event_tx.send(SignalEvent::Closed {
                                code: 1006,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                Some(Command::Request { method, data }) => {
                    let Some(conn) = &state.conn else {
                        debug!(%method, "request dropped, not connected");
                        continue;
                    };
                    let id = state.ids.next_id();
                    state.outstanding.insert(id);
                    let msg = ProtooMessage::request(id, &method, data);
                    conn.send_text(msg.to_json().to_string());
                    trace!(id, %method, "request sent");
                }
                Some(Command::Notify { method, data }) => {
                    let Some(conn) = &state.conn else {
                        debug!(%method, "notification dropped, not connected");
                        continue;
                    };
                    let msg = ProtooMessage::notification(&method, data);
                    conn.send_text(msg.to_json().to_string());
                }
            },

            Some(event) = recv_opt(&mut ws_rx) => match event {
                WsEvent::Text(text) => classify(&mut state, &event_tx, text),
                WsEvent::Binary(data) => {
                    warn!(len = data.len(), "unexpected binary frame on signalling socket");
                }
                WsEvent::Closed { code, reason } => {
                    info!(code, %reason, "signalling socket closed");
                    state.conn = None;
                    ws_rx = None;
                    state.outstanding.clear();
                    let _ = event_tx.send(SignalEvent::Closed { code, reason });
                }
            },
        }
    }
}

async fn recv_opt(rx: &mut Option<mpsc::UnboundedReceiver<WsEvent>>) -> Option<WsEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn classify(state: &mut ClientState, event_tx: &mpsc::UnboundedSender<SignalEvent>, text: String) {
    match ProtooMessage::parse(&text) {
        Ok(ProtooMessage::Response { id, .. }) => {
            if !state.outstanding.remove(&id) {
                debug!(id, "response with unknown id ignored");
                return;
            }
            let _ = event_tx.send(SignalEvent::Response(text));
        }
        Ok(ProtooMessage::Notification { .. }) => {
            let _ = event_tx.send(SignalEvent::Notification(text));
        }
        Ok(ProtooMessage::Request { id, method, .. }) => {
            // The worker never serves peer requests; answer so the peer
            // does not wait for a timeout.
            debug!(id, %method, "peer request declined");
            if let Some(conn) = &state.conn {
                let reply = ProtooMessage::error_response(id, 501, "not implemented");
                conn.send_text(reply.to_json().to_string());
            }
        }
        Err(e) => {
            warn!(error = %e, "unparseable signalling text dropped");
        }
    }
}
