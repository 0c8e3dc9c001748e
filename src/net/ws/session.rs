//! Established-connection runtime shared by client and server WebSockets.
//!
//! A session owns its transport inside a dedicated task. The owner talks
//! to it through a [`WsHandle`] (outgoing messages) and an event receiver
//! (incoming messages and the close notification). Keepalive pings are
//! sent every 2 s; a peer that stops answering is declared dead after the
//! role-specific pong timeout and the session closes locally.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::errors::ProtocolError;
use crate::net::tls::Transport;
use crate::utils::now_millis;

use super::frame::{self, Frame, FrameDecoder, Opcode};

/// Which side of the connection this session is; decides masking and the
/// pong timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn pong_timeout_ms(&self) -> i64 {
        match self {
            Role::Client => 15_000,
            Role::Server => 60_000,
        }
    }

    fn mask(&self) -> Option<[u8; 4]> {
        match self {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        }
    }
}

const PING_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug)]
pub enum WsEvent {
    Text(String),
    Binary(Vec<u8>),
    /// The connection is gone, whatever the cause; `code` is the close
    /// code observed or synthesized locally.
    Closed { code: u16, reason: String },
}

#[derive(Debug)]
enum WsCommand {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Cheap clonable sender half handed to the session owner.
#[derive(Debug, Clone)]
pub struct WsHandle {
    tx: mpsc::UnboundedSender<WsCommand>,
}

impl WsHandle {
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(WsCommand::Text(text.into()));
    }

    pub fn send_binary(&self, data: Vec<u8>) {
        let _ = self.tx.send(WsCommand::Binary(data));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(WsCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Spawn the session task over an upgraded transport. `leftover` carries
/// bytes that arrived bundled with the handshake.
pub fn spawn(
    transport: Transport,
    leftover: Vec<u8>,
    role: Role,
) -> (WsHandle, mpsc::UnboundedReceiver<WsEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_session(transport, leftover, role, cmd_rx, event_tx));
    (WsHandle { tx: cmd_tx }, event_rx)
}

struct SessionState {
    role: Role,
    decoder: FrameDecoder,
    /// In-progress fragmented message: first opcode plus accumulated payload.
    fragment: Option<(Opcode, Vec<u8>)>,
    last_recv_pong_ms: i64,
}

async fn run_session(
    mut transport: Transport,
    leftover: Vec<u8>,
    role: Role,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    event_tx: mpsc::UnboundedSender<WsEvent>,
) {
    let mut state = SessionState {
        role,
        decoder: FrameDecoder::new(),
        fragment: None,
        last_recv_pong_ms: now_millis(),
    };
    state.decoder.feed(&leftover);

    // First tick after one full interval; an immediate tick would double
    // the ping rate right after the handshake.
    let mut ping_timer = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut read_buf = [0u8; 16 * 1024];

    // Frames bundled with the handshake are processed before any socket read.
    let mut startup_close = None;
    match drain_frames(&mut state, &mut transport, &event_tx).await {
        Ok(true) => {}
        Ok(false) => {
            let _ = transport.shutdown().await;
            return;
        }
        Err((code, reason)) => startup_close = Some((code, reason)),
    }

    let close = if let Some(close) = startup_close {
        Some(close)
    } else {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None => break None,
                    Some(WsCommand::Text(text)) => {
                        if write_frame(&mut transport, &Frame::text(text), role).await.is_err() {
                            break Some((1006, "write failed".to_string()));
                        }
                    }
                    Some(WsCommand::Binary(data)) => {
                        if write_frame(&mut transport, &Frame::binary(data), role).await.is_err() {
                            break Some((1006, "write failed".to_string()));
                        }
                    }
                    Some(WsCommand::Close { code, reason }) => {
                        let _ = write_frame(&mut transport, &Frame::close(code, &reason), role).await;
                        break Some((code, reason));
                    }
                },

                _ = ping_timer.tick() => {
                    let now = now_millis();
                    if now - state.last_recv_pong_ms > role.pong_timeout_ms() {
                        warn!(role = ?role, "ping/pong timeout, closing");
                        let _ = write_frame(&mut transport, &Frame::close(1001, "ping timeout"), role).await;
                        break Some((1001, "ping/pong timeout".to_string()));
                    }
                    let payload = now.to_string().into_bytes();
                    if write_frame(&mut transport, &Frame::ping(payload), role).await.is_err() {
                        break Some((1006, "write failed".to_string()));
                    }
                }

                read = transport.read(&mut read_buf) => match read {
                    Ok(0) => break Some((1006, "peer closed transport".to_string())),
                    Ok(n) => {
                        state.decoder.feed(&read_buf[..n]);
                        match drain_frames(&mut state, &mut transport, &event_tx).await {
                            Ok(true) => {}
                            // Close sequence done, Closed already emitted.
                            Ok(false) => break None,
                            Err((code, reason)) => break Some((code, reason)),
                        }
                    }
                    Err(e) => break Some((1006, e.to_string())),
                },
            }
        }
    };

    if let Some((code, reason)) = close {
        let _ = event_tx.send(WsEvent::Closed { code, reason });
    }
    let _ = transport.shutdown().await;
}

/// Process every complete frame in the decoder.
///
/// `Ok(true)` keeps the session running, `Ok(false)` means the close
/// sequence finished and the Closed event was already emitted, `Err`
/// carries the close to perform.
async fn drain_frames(
    state: &mut SessionState,
    transport: &mut Transport,
    event_tx: &mpsc::UnboundedSender<WsEvent>,
) -> Result<bool, (u16, String)> {
    loop {
        let frame = match state.decoder.next() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(true),
            Err(e) => {
                let reason = protocol_close_reason(&e);
                let _ = write_frame(transport, &Frame::close(1002, &reason), state.role).await;
                return Err((1002, reason));
            }
        };
        match frame.opcode {
            Opcode::Ping => {
                debug!(len = frame.payload.len(), "ping");
                if write_frame(transport, &Frame::pong(frame.payload), state.role)
                    .await
                    .is_err()
                {
                    return Err((1006, "write failed".to_string()));
                }
            }
            Opcode::Pong => {
                state.last_recv_pong_ms = now_millis();
            }
            Opcode::Close => {
                let (code, reason) = match frame.close_code() {
                    None => (1005, String::new()),
                    Some(code) if frame::is_valid_close_code(code) => {
                        (code, frame.close_reason())
                    }
                    Some(code) => {
                        warn!(code, "invalid close code");
                        let _ = write_frame(
                            transport,
                            &Frame::close(1002, "Invalid close code"),
                            state.role,
                        )
                        .await;
                        let _ = event_tx.send(WsEvent::Closed {
                            code: 1002,
                            reason: "Invalid close code".to_string(),
                        });
                        return Ok(false);
                    }
                };
                // Echo the close and notify the owner.
                let echo = match frame.close_code() {
                    None => Frame {
                        fin: true,
                        opcode: Opcode::Close,
                        payload: Vec::new(),
                    },
                    Some(code) => Frame::close(code, ""),
                };
                let _ = write_frame(transport, &echo, state.role).await;
                let _ = event_tx.send(WsEvent::Closed { code, reason });
                return Ok(false);
            }
            Opcode::Text | Opcode::Binary => {
                if state.fragment.is_some() {
                    return Err((1002, "data frame while fragment pending".to_string()));
                }
                if frame.fin {
                    deliver(event_tx, frame.opcode, frame.payload)?;
                } else {
                    state.fragment = Some((frame.opcode, frame.payload));
                }
            }
            Opcode::Continuation => {
                let Some((opcode, mut payload)) = state.fragment.take() else {
                    return Err((1002, "continuation without initial frame".to_string()));
                };
                payload.extend_from_slice(&frame.payload);
                if payload.len() > frame::MAX_FRAME_PAYLOAD {
                    return Err((1002, "fragmented message too large".to_string()));
                }
                if frame.fin {
                    deliver(event_tx, opcode, payload)?;
                } else {
                    state.fragment = Some((opcode, payload));
                }
            }
        }
    }
}

fn deliver(
    event_tx: &mpsc::UnboundedSender<WsEvent>,
    opcode: Opcode,
    payload: Vec<u8>,
) -> Result<(), (u16, String)> {
    match opcode {
        Opcode::Text => match String::from_utf8(payload) {
            Ok(text) => {
                let _ = event_tx.send(WsEvent::Text(text));
                Ok(())
            }
            Err(_) => Err((1002, "text frame is not valid UTF-8".to_string())),
        },
        Opcode::Binary => {
            let _ = event_tx.send(WsEvent::Binary(payload));
            Ok(())
        }
        _ => Ok(()),
    }
}

fn protocol_close_reason(e: &ProtocolError) -> String {
    match e {
        ProtocolError::WebSocket(msg) => msg.clone(),
        other => other.to_string(),
    }
}

async fn write_frame(
    transport: &mut Transport,
    frame: &Frame,
    role: Role,
) -> std::io::Result<()> {
    let wire = frame::encode(frame, role.mask());
    transport.write_all(&wire).await?;
    transport.flush().await
}
