//! Room manager: the owner of the signalling client and the room registry.
//!
//! Everything here runs on one task. The 10 ms tick reconnects (throttled
//! to one attempt per 5 s), keeps the uplink warm with an `echo` request
//! every 15 s, drains the outbound notification queue completely, and
//! sweeps dead rooms. Inbound notifications are routed by method to the
//! rooms, which are created on first reference.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::net::ws::client::WsClientConfig;
use crate::signal::client::{ProtooClient, SignalEvent, PROTOO_SUBPROTOCOL};
use crate::tts::SpeechSynthesizer;
use crate::utils::{now_millis, unix_millis};

use super::notification::NotificationQueue;
use super::room::Room;

const TICK_INTERVAL: Duration = Duration::from_millis(10);
/// At most one connect attempt per 5 s.
const CONNECT_THROTTLE_MS: i64 = 5_000;
/// Echo keepalive period on the signalling uplink.
const ECHO_INTERVAL_MS: i64 = 15_000;

pub struct RoomManager {
    client: ProtooClient,
    signal_rx: mpsc::UnboundedReceiver<SignalEvent>,
    rooms: HashMap<String, Room>,
    outbound: Arc<NotificationQueue>,
    engine: Arc<dyn SpeechSynthesizer>,
    connected: bool,
    last_connect_ms: i64,
    last_echo_ms: i64,
}

impl RoomManager {
    pub fn new(config: &WorkerConfig, engine: Arc<dyn SpeechSynthesizer>) -> Self {
        let ws_cfg = WsClientConfig {
            host: config.ws_server.host.clone(),
            port: config.ws_server.port,
            path: config.ws_server.subpath.clone(),
            enable_tls: config.ws_server.enable_ssl,
            subprotocol: Some(PROTOO_SUBPROTOCOL.to_string()),
        };
        info!(url = %config.ws_server.url(), "room manager starting");
        let (client, signal_rx) = ProtooClient::spawn(ws_cfg);
        Self {
            client,
            signal_rx,
            rooms: HashMap::new(),
            outbound: Arc::new(NotificationQueue::new()),
            engine,
            connected: false,
            last_connect_ms: i64::MIN / 2,
            last_echo_ms: i64::MIN / 2,
        }
    }

    /// Run until `shutdown` resolves. Rooms are closed on the way out.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) {
        let mut tick = interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = tick.tick() => self.on_tick(),
                event = self.signal_rx.recv() => match event {
                    Some(event) => self.on_signal(event),
                    None => {
                        warn!("signalling task ended");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        for (room_id, room) in self.rooms.drain() {
            debug!(%room_id, "closing room on shutdown");
            room.close();
        }
    }

    fn on_tick(&mut self) {
        let now = now_millis();
        if !self.connected && now - self.last_connect_ms >= CONNECT_THROTTLE_MS {
            self.last_connect_ms = now;
            debug!("attempting signalling connect");
            self.client.async_connect();
        }
        if self.connected && now - self.last_echo_ms >= ECHO_INTERVAL_MS {
            self.last_echo_ms = now;
            self.client.request(
                "echo",
                json!({
                    "method": "echo",
                    "ts": unix_millis(),
                    "type": "voiceagent_worker",
                }),
            );
        }
        self.drain_outbound();
        self.sweep_rooms(now);
    }

    /// Total drain: everything enqueued before this tick goes out now.
    /// While disconnected, drained notifications are dropped.
    fn drain_outbound(&mut self) {
        let batch = self.outbound.drain();
        if batch.is_empty() {
            return;
        }
        if !self.connected {
            debug!(dropped = batch.len(), "outbound notifications dropped while disconnected");
            return;
        }
        for note in batch {
            let mut data = json!({
                "method": note.method,
                "ts": unix_millis(),
                "roomId": note.room_id,
                "userId": note.user_id,
                "msg": note.msg_b64,
            });
            if note.task_index > 0 {
                data["taskIndex"] = json!(note.task_index);
            }
            self.client.notify(note.method, data);
        }
    }

    fn sweep_rooms(&mut self, now: i64) {
        self.rooms.retain(|room_id, room| {
            if room.is_alive_at(now) {
                true
            } else {
                info!(%room_id, "room idle, evicting");
                room.close();
                false
            }
        });
    }

    fn on_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Connected => {
                info!("signalling connected");
                self.connected = true;
            }
            SignalEvent::Closed { code, reason } => {
                info!(code, %reason, "signalling closed");
                self.connected = false;
            }
            SignalEvent::Response(text) => {
                debug!(%text, "signalling response");
            }
            SignalEvent::Notification(text) => self.route_notification(&text),
        }
    }

    fn route_notification(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unparseable notification dropped");
                return;
            }
        };
        let Some(method) = value.get("method").and_then(Value::as_str) else {
            warn!("notification without method dropped");
            return;
        };
        let Some(data) = value.get("data").filter(|d| d.is_object()) else {
            warn!(%method, "notification without data object dropped");
            return;
        };
        match method {
            "opus_data" => self.handle_opus_data(data),
            "response.text" => self.handle_response_text(data),
            other => {
                warn!(method = %other, "unhandled notification method dropped");
            }
        }
    }

    fn handle_opus_data(&mut self, data: &Value) {
        if data.get("type").and_then(Value::as_str) != Some("opus_data") {
            warn!("opus_data notification with wrong type dropped");
            return;
        }
        let Some((room_id, user_id)) = room_and_user(data) else {
            warn!("opus_data with missing roomId/userId dropped");
            return;
        };
        let Some(opus_b64) = data.get("opus_base64").and_then(Value::as_str) else {
            warn!(%room_id, "opus_data without opus_base64 dropped");
            return;
        };
        let opus = match BASE64.decode(opus_b64) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                warn!(%room_id, "opus_data decoded to empty payload, dropped");
                return;
            }
            Err(e) => {
                warn!(%room_id, error = %e, "opus_data with invalid base64 dropped");
                return;
            }
        };
        debug!(%room_id, %user_id, len = opus.len(), "routing opus data");
        self.get_or_create_room(&room_id).on_opus(&user_id, opus);
    }

    fn handle_response_text(&mut self, data: &Value) {
        let Some((room_id, user_id)) = room_and_user(data) else {
            warn!("response.text with missing roomId/userId dropped");
            return;
        };
        let Some(text) = data.get("text").and_then(Value::as_str).filter(|t| !t.is_empty())
        else {
            warn!(%room_id, "response.text without text dropped");
            return;
        };
        self.get_or_create_room(&room_id).on_text(&user_id, text);
    }

    fn get_or_create_room(&mut self, room_id: &str) -> &Room {
        let outbound = self.outbound.clone();
        let engine = self.engine.clone();
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id, outbound, engine))
    }

    #[cfg(test)]
    pub(crate) fn rooms_for_test(&mut self) -> &mut HashMap<String, Room> {
        &mut self.rooms
    }

    #[cfg(test)]
    pub(crate) fn sweep_for_test(&mut self) {
        self.sweep_rooms(now_millis());
    }

    #[cfg(test)]
    pub(crate) fn route_for_test(&mut self, text: &str) {
        self.route_notification(text);
    }
}

/// Non-empty `roomId` and `userId`, or nothing.
fn room_and_user(data: &Value) -> Option<(String, String)> {
    let room_id = data.get("roomId").and_then(Value::as_str)?;
    let user_id = data.get("userId").and_then(Value::as_str)?;
    if room_id.is_empty() || user_id.is_empty() {
        return None;
    }
    Some((room_id.to_string(), user_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::DisabledSynthesizer;

    fn test_manager() -> RoomManager {
        let config = WorkerConfig::default();
        RoomManager::new(&config, Arc::new(DisabledSynthesizer))
    }

    fn opus_b64() -> String {
        let mut enc =
            opus::Encoder::new(48000, opus::Channels::Stereo, opus::Application::Audio).unwrap();
        let pcm = vec![0i16; 960 * 2];
        BASE64.encode(enc.encode_vec(&pcm, 4000).unwrap())
    }

    #[tokio::test]
    async fn opus_data_creates_a_room() {
        let mut mgr = test_manager();
        let text = json!({
            "notification": true,
            "method": "opus_data",
            "data": {
                "type": "opus_data",
                "roomId": "R1",
                "userId": "U1",
                "opus_base64": opus_b64(),
            },
        })
        .to_string();
        mgr.route_for_test(&text);
        assert!(mgr.rooms_for_test().contains_key("R1"));
    }

    #[tokio::test]
    async fn invalid_opus_data_is_dropped_without_room() {
        let mut mgr = test_manager();
        for data in [
            json!({"type": "opus_data", "roomId": "", "userId": "U", "opus_base64": opus_b64()}),
            json!({"type": "opus_data", "roomId": "R", "userId": "", "opus_base64": opus_b64()}),
            json!({"type": "opus_data", "roomId": "R", "userId": "U", "opus_base64": ""}),
            json!({"type": "opus_data", "roomId": "R", "userId": "U", "opus_base64": "!!not-b64!!"}),
            json!({"type": "wrong", "roomId": "R", "userId": "U", "opus_base64": opus_b64()}),
            json!({"roomId": "R", "userId": "U"}),
        ] {
            let text = json!({
                "notification": true,
                "method": "opus_data",
                "data": data,
            })
            .to_string();
            mgr.route_for_test(&text);
        }
        assert!(mgr.rooms_for_test().is_empty());
    }

    #[tokio::test]
    async fn unknown_method_is_dropped() {
        let mut mgr = test_manager();
        let text = json!({
            "notification": true,
            "method": "unknown_thing",
            "data": {"roomId": "R", "userId": "U"},
        })
        .to_string();
        mgr.route_for_test(&text);
        assert!(mgr.rooms_for_test().is_empty());
    }

    #[tokio::test]
    async fn response_text_creates_a_room() {
        let mut mgr = test_manager();
        let text = json!({
            "notification": true,
            "method": "response.text",
            "data": {"roomId": "R2", "userId": "U2", "text": "hello"},
        })
        .to_string();
        mgr.route_for_test(&text);
        assert!(mgr.rooms_for_test().contains_key("R2"));
    }

    #[tokio::test]
    async fn idle_room_is_evicted_on_sweep() {
        let mut mgr = test_manager();
        let text = json!({
            "notification": true,
            "method": "response.text",
            "data": {"roomId": "R3", "userId": "U", "text": "hi"},
        })
        .to_string();
        mgr.route_for_test(&text);
        assert!(mgr.rooms_for_test().contains_key("R3"));

        // Fresh rooms survive a sweep.
        mgr.sweep_for_test();
        assert!(mgr.rooms_for_test().contains_key("R3"));

        // Age the room past the 60 s idle window; the next sweep evicts it.
        mgr.rooms_for_test().get("R3").unwrap().age_for_test(60_001);
        mgr.sweep_for_test();
        assert!(!mgr.rooms_for_test().contains_key("R3"));
    }
}
