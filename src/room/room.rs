//! Per-room media state machine.
//!
//! A room aggregates one user's inbound voice and the synthesized voice
//! going back. Pipeline stages are created lazily: the decoder on the
//! first Opus packet, the filter on the first decoded frame (whose format
//! it must match), the TTS adapter on the first text. Timestamps come
//! from a synthetic clock: every accepted packet advances the input clock
//! by exactly 20 ms, whatever the wall clock did.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::media::filter::SPEECH_EXPORT_DESC;
use crate::media::{
    AudioFilter, CodecId, Decoder, DecoderInput, EncodedPacket, FilterParams, MediaEvent,
    MediaPayload, TimeBase,
};
use crate::tts::{SpeechSynthesizer, TtsAdapter};
use crate::utils::now_millis;

use super::notification::{NotificationQueue, RoomNotification};

/// Rooms die after a minute without inbound audio.
const ROOM_IDLE_TIMEOUT_MS: i64 = 60_000;
/// Synthetic advance per accepted inbound packet.
const INPUT_STEP_MS: i64 = 20;
/// Inbound packets are stamped in 48 kHz ticks.
const INPUT_TIME_BASE: TimeBase = TimeBase::new(1, 48_000);

pub struct Room {
    shared: Arc<RoomShared>,
}

struct RoomShared {
    room_id: String,
    /// Last user whose audio was accepted; stamped on all outbound
    /// notifications.
    user_id: Mutex<String>,
    closed: AtomicBool,
    last_input_ms: AtomicI64,
    decoder: Mutex<Option<Decoder>>,
    filter: Mutex<Option<AudioFilter>>,
    tts: Mutex<Option<TtsAdapter>>,
    outbound: Arc<NotificationQueue>,
    engine: Arc<dyn SpeechSynthesizer>,
}

impl Room {
    pub fn new(
        room_id: &str,
        outbound: Arc<NotificationQueue>,
        engine: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        info!(room_id, "room created");
        Self {
            shared: Arc::new(RoomShared {
                room_id: room_id.to_string(),
                user_id: Mutex::new(String::new()),
                closed: AtomicBool::new(false),
                last_input_ms: AtomicI64::new(now_millis()),
                decoder: Mutex::new(None),
                filter: Mutex::new(None),
                tts: Mutex::new(None),
                outbound,
                engine,
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.shared.room_id
    }

    /// Inbound Opus from the signalling fabric.
    pub fn on_opus(&self, user_id: &str, data: Vec<u8>) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        *shared.user_id.lock() = user_id.to_string();

        {
            let mut decoder = shared.decoder.lock();
            if decoder.is_none() {
                let d = Decoder::new();
                let weak = Arc::downgrade(shared);
                d.set_sink(Arc::new(move |ev| RoomShared::route_media(&weak, ev)));
                *decoder = Some(d);
            }
        }

        // The synthetic clock advances by one 20 ms frame per packet,
        // before dispatch and with no back-correction for late arrivals.
        let input_ms = shared
            .last_input_ms
            .fetch_add(INPUT_STEP_MS, Ordering::AcqRel)
            + INPUT_STEP_MS;
        let pts = input_ms * INPUT_TIME_BASE.den as i64 / 1000;

        debug!(
            room_id = %shared.room_id,
            user_id,
            len = data.len(),
            pts,
            "inbound opus packet"
        );
        let decoder = shared.decoder.lock();
        if let Some(decoder) = decoder.as_ref() {
            decoder.on_data(DecoderInput::Packet(EncodedPacket {
                codec: CodecId::Opus,
                data,
                pts,
                time_base: INPUT_TIME_BASE,
                tag: 0,
            }));
        }
    }

    /// Externally generated response text for this room's user.
    pub fn on_text(&self, user_id: &str, text: &str) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        info!(room_id = %shared.room_id, user_id, len = text.len(), "response text");

        let mut tts = shared.tts.lock();
        if tts.is_none() {
            let outbound = shared.outbound.clone();
            let room_id = shared.room_id.clone();
            let shared_weak = Arc::downgrade(shared);
            let sink = Arc::new(move |packet: EncodedPacket| {
                let Some(shared) = shared_weak.upgrade() else {
                    return;
                };
                if shared.closed.load(Ordering::Acquire) {
                    return;
                }
                outbound.push(RoomNotification {
                    method: "tts_opus_data",
                    room_id: room_id.clone(),
                    user_id: shared.user_id.lock().clone(),
                    msg_b64: BASE64.encode(&packet.data),
                    task_index: packet.tag,
                });
            });
            *tts = Some(TtsAdapter::new(user_id, shared.engine.clone(), sink));
        }
        if let Some(tts) = tts.as_ref() {
            tts.input_text(text);
        }
    }

    /// A room is alive while not closed and fed within the last minute.
    pub fn is_alive(&self) -> bool {
        self.is_alive_at(now_millis())
    }

    pub(crate) fn is_alive_at(&self, now_ms: i64) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        now_ms - self.shared.last_input_ms.load(Ordering::Acquire) < ROOM_IDLE_TIMEOUT_MS
    }

    /// Idempotent. Stops the stages in order (decoder, filter, then TTS
    /// with its encoder), joining each worker.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(room_id = %shared.room_id, "room closed");
        // Take each stage out under its lock, then drop (and join) with no
        // lock held; a worker inside the media sink may be waiting on
        // these same mutexes.
        let decoder = shared.decoder.lock().take();
        let filter = shared.filter.lock().take();
        let tts = shared.tts.lock().take();
        drop(decoder);
        drop(filter);
        drop(tts);
    }

    #[cfg(test)]
    pub(crate) fn age_for_test(&self, ms: i64) {
        self.shared.last_input_ms.fetch_sub(ms, Ordering::AcqRel);
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.close();
        debug!(room_id = %self.shared.room_id, "room destroyed");
    }
}

impl RoomShared {
    /// Sink shared by the decoder and the filter; runs on their worker
    /// threads and demultiplexes on the producing stage's id.
    fn route_media(weak: &Weak<RoomShared>, event: MediaEvent) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if shared.closed.load(Ordering::Acquire) {
            return;
        }

        let decoder_id = shared.decoder.lock().as_ref().map(|d| d.id());
        if decoder_id.as_deref() == Some(&*event.source_id) {
            let MediaPayload::Frame(frame) = event.payload else {
                return;
            };
            // Filter is built to match the first decoded frame's format.
            let mut filter = shared.filter.lock();
            if filter.is_none() {
                let params = FilterParams {
                    sample_rate: frame.sample_rate,
                    layout: frame.layout,
                    format: frame.format,
                    time_base: TimeBase::new(1, frame.sample_rate),
                };
                match AudioFilter::new(params, SPEECH_EXPORT_DESC) {
                    Ok(f) => {
                        let weak = Weak::clone(weak);
                        f.set_sink(Arc::new(move |ev| RoomShared::route_media(&weak, ev)));
                        *filter = Some(f);
                    }
                    Err(e) => {
                        warn!(room_id = %shared.room_id, error = %e, "filter init failed");
                        return;
                    }
                }
            }
            if let Some(filter) = filter.as_ref() {
                filter.on_data(frame);
            }
            return;
        }

        let filter_id = shared.filter.lock().as_ref().map(|f| f.id());
        if filter_id.as_deref() == Some(&*event.source_id) {
            let MediaPayload::Frame(frame) = event.payload else {
                return;
            };
            debug!(
                room_id = %shared.room_id,
                pts = frame.pts,
                samples = frame.nb_samples,
                "pcm frame exported"
            );
            shared.outbound.push(RoomNotification {
                method: "pcm_data",
                room_id: shared.room_id.clone(),
                user_id: shared.user_id.lock().clone(),
                msg_b64: BASE64.encode(&frame.data),
                task_index: 0,
            });
            return;
        }

        warn!(
            room_id = %shared.room_id,
            source = %event.source_id,
            "media event from unknown stage dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::DisabledSynthesizer;
    use std::time::Duration;

    fn opus_frame_20ms() -> Vec<u8> {
        let mut enc =
            opus::Encoder::new(48000, opus::Channels::Stereo, opus::Application::Audio).unwrap();
        let pcm: Vec<i16> = (0..960 * 2).map(|i| ((i as f32) * 0.01).sin() as i16).collect();
        enc.encode_vec(&pcm, 4000).unwrap()
    }

    fn test_room() -> (Room, Arc<NotificationQueue>) {
        let queue = Arc::new(NotificationQueue::new());
        let room = Room::new("R", queue.clone(), Arc::new(DisabledSynthesizer));
        (room, queue)
    }

    fn wait_for_notifications(queue: &NotificationQueue, n: usize) -> Vec<RoomNotification> {
        let mut out = Vec::new();
        for _ in 0..500 {
            out.extend(queue.drain());
            if out.len() >= n {
                return out;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        out
    }

    #[test]
    fn two_opus_packets_yield_two_640_byte_pcm_exports() {
        let (room, queue) = test_room();
        let packet = opus_frame_20ms();
        room.on_opus("U", packet.clone());
        room.on_opus("U", packet);

        let notes = wait_for_notifications(&queue, 2);
        assert_eq!(notes.len(), 2);
        for note in &notes {
            assert_eq!(note.method, "pcm_data");
            assert_eq!(note.room_id, "R");
            assert_eq!(note.user_id, "U");
            // 20 ms of 16 kHz mono s16.
            let pcm = BASE64.decode(&note.msg_b64).unwrap();
            assert_eq!(pcm.len(), 640);
        }
    }

    #[test]
    fn liveness_window_is_one_minute() {
        let (room, _queue) = test_room();
        let now = now_millis();
        assert!(room.is_alive_at(now));
        assert!(room.is_alive_at(now + ROOM_IDLE_TIMEOUT_MS - 1));
        assert!(!room.is_alive_at(now + ROOM_IDLE_TIMEOUT_MS));
        assert!(!room.is_alive_at(now + ROOM_IDLE_TIMEOUT_MS + 1));
    }

    #[test]
    fn input_advances_the_synthetic_clock_by_20ms() {
        let (room, _queue) = test_room();
        let before = room.shared.last_input_ms.load(Ordering::Acquire);
        room.on_opus("U", opus_frame_20ms());
        room.on_opus("U", opus_frame_20ms());
        let after = room.shared.last_input_ms.load(Ordering::Acquire);
        assert_eq!(after - before, 2 * INPUT_STEP_MS);
    }

    #[test]
    fn closed_room_ignores_input_and_is_dead() {
        let (room, queue) = test_room();
        room.close();
        room.close(); // idempotent
        assert!(!room.is_alive());
        room.on_opus("U", opus_frame_20ms());
        room.on_text("U", "hello");
        std::thread::sleep(Duration::from_millis(100));
        assert!(queue.is_empty());
    }

    #[test]
    fn last_user_wins() {
        let (room, queue) = test_room();
        room.on_opus("alice", opus_frame_20ms());
        let _ = wait_for_notifications(&queue, 1);
        room.on_opus("bob", opus_frame_20ms());
        let notes = wait_for_notifications(&queue, 1);
        assert!(notes.iter().all(|n| n.user_id == "alice" || n.user_id == "bob"));
        // After the second packet the recorded user is bob.
        assert_eq!(*room.shared.user_id.lock(), "bob");
    }
}
