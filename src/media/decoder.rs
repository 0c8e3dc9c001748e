//! Opus decoding stage.
//!
//! The decoder opens its codec lazily on the first packet, runs it on a
//! dedicated worker thread and emits decoded frames tagged with the
//! stage's id. A packet that fails to decode is dropped; the stage (and
//! the codec state) stays alive for the next one.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::MediaError;

use super::packet::{
    AudioFrame, ChannelLayout, CodecId, EncodedPacket, MediaEvent, MediaPayload, SinkFn,
};
use super::stage::{spawn_worker, BoundedQueue, DEFAULT_QUEUE_DEPTH};

/// Opus always decodes at 48 kHz; mono input is upmixed by the codec.
const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_DECODE_LAYOUT: ChannelLayout = ChannelLayout::Stereo;
/// 120 ms at 48 kHz, the largest frame Opus permits.
const MAX_OPUS_FRAME_SAMPLES: usize = 5760;

/// Decoder input: compressed packets, or codec parameters for formats
/// that need out-of-band extradata before the first packet.
#[derive(Debug)]
pub enum DecoderInput {
    Packet(EncodedPacket),
    CodecParams { codec: CodecId, extradata: Vec<u8> },
}

pub struct Decoder {
    id: Arc<str>,
    queue: Arc<BoundedQueue<DecoderInput>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<Mutex<Option<SinkFn>>>,
}

impl Decoder {
    pub fn new() -> Self {
        let id: Arc<str> = uuid::Uuid::new_v4().to_string().into();
        debug!(%id, "decoder created");
        Self {
            queue: Arc::new(BoundedQueue::new(&format!("decoder-{id}"), DEFAULT_QUEUE_DEPTH)),
            worker: Mutex::new(None),
            sink: Arc::new(Mutex::new(None)),
            id,
        }
    }

    pub fn id(&self) -> Arc<str> {
        self.id.clone()
    }

    pub fn set_sink(&self, sink: SinkFn) {
        *self.sink.lock() = Some(sink);
    }

    /// Queue input without blocking; the worker starts on first call.
    pub fn on_data(&self, input: DecoderInput) {
        self.ensure_worker();
        self.queue.push(input);
    }

    fn ensure_worker(&self) {
        let mut guard = self.worker.lock();
        if guard.is_some() {
            return;
        }
        let queue = self.queue.clone();
        let sink = self.sink.clone();
        let id = self.id.clone();
        let mut state = DecodeState::new(id.clone());
        *guard = Some(spawn_worker("opus-decoder", queue, move |input| {
            match state.process(input) {
                Ok(Some(frame)) => {
                    if let Some(sink) = sink.lock().clone() {
                        sink(MediaEvent {
                            source_id: id.clone(),
                            payload: MediaPayload::Frame(frame),
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(decoder = %id, error = %e, "packet dropped"),
            }
        }));
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.worker.lock().take() {
            if std::thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
        debug!(decoder = %self.id, "decoder destroyed");
    }
}

/// Worker-thread state; the codec handle never leaves this thread.
struct DecodeState {
    id: Arc<str>,
    codec: Option<opus::Decoder>,
    scratch: Vec<f32>,
}

impl DecodeState {
    fn new(id: Arc<str>) -> Self {
        Self {
            id,
            codec: None,
            scratch: vec![0.0; MAX_OPUS_FRAME_SAMPLES * OPUS_DECODE_LAYOUT.channels()],
        }
    }

    fn process(&mut self, input: DecoderInput) -> Result<Option<AudioFrame>, MediaError> {
        let packet = match input {
            DecoderInput::CodecParams { codec, extradata } => {
                // Opus needs no extradata; recorded for completeness.
                debug!(decoder = %self.id, ?codec, len = extradata.len(), "codec parameters received");
                return Ok(None);
            }
            DecoderInput::Packet(packet) => packet,
        };

        if self.codec.is_none() {
            let decoder = opus::Decoder::new(
                OPUS_SAMPLE_RATE,
                opus::Channels::Stereo,
            )
            .map_err(|e| MediaError::CodecOpen(format!("opus decoder: {e}")))?;
            self.codec = Some(decoder);
            debug!(decoder = %self.id, "opus codec opened");
        }
        let codec = self.codec.as_mut().expect("codec opened above");

        let samples_per_channel = codec
            .decode_float(&packet.data, &mut self.scratch, false)
            .map_err(|e| MediaError::Decode(e.to_string()))?;
        if samples_per_channel == 0 {
            return Ok(None);
        }
        let interleaved = &self.scratch[..samples_per_channel * OPUS_DECODE_LAYOUT.channels()];
        let mut frame = AudioFrame::from_f32(
            interleaved,
            OPUS_SAMPLE_RATE,
            OPUS_DECODE_LAYOUT,
            packet.pts,
            // Decoded frames inherit the packet's time base when the codec
            // leaves it unset, which Opus always does.
            packet.time_base,
        );
        frame.tag = packet.tag;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::packet::TimeBase;
    use std::sync::mpsc;
    use std::time::Duration;

    fn one_opus_frame() -> Vec<u8> {
        let mut enc =
            opus::Encoder::new(48000, opus::Channels::Stereo, opus::Application::Audio).unwrap();
        let pcm = vec![0i16; 960 * 2];
        enc.encode_vec(&pcm, 4000).unwrap()
    }

    #[test]
    fn decodes_one_packet_into_a_48k_stereo_frame() {
        let decoder = Decoder::new();
        let (tx, rx) = mpsc::channel();
        let id = decoder.id();
        decoder.set_sink(Arc::new(move |ev: MediaEvent| {
            tx.send(ev).unwrap();
        }));

        decoder.on_data(DecoderInput::Packet(EncodedPacket {
            codec: CodecId::Opus,
            data: one_opus_frame(),
            pts: 960,
            time_base: TimeBase::new(1, 48000),
            tag: 0,
        }));

        let ev = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ev.source_id, id);
        let MediaPayload::Frame(frame) = ev.payload else {
            panic!("expected frame");
        };
        assert_eq!(frame.sample_rate, 48000);
        assert_eq!(frame.layout, ChannelLayout::Stereo);
        assert_eq!(frame.nb_samples, 960);
        assert_eq!(frame.pts, 960);
    }

    #[test]
    fn garbage_packet_is_dropped_and_stage_survives() {
        let decoder = Decoder::new();
        let (tx, rx) = mpsc::channel();
        decoder.set_sink(Arc::new(move |ev: MediaEvent| {
            tx.send(ev).unwrap();
        }));

        // A lone code-3 TOC byte with no frame-count byte is invalid.
        decoder.on_data(DecoderInput::Packet(EncodedPacket {
            codec: CodecId::Opus,
            data: vec![0x03],
            pts: 0,
            time_base: TimeBase::new(1, 48000),
            tag: 0,
        }));
        decoder.on_data(DecoderInput::Packet(EncodedPacket {
            codec: CodecId::Opus,
            data: one_opus_frame(),
            pts: 1920,
            time_base: TimeBase::new(1, 48000),
            tag: 0,
        }));

        // Only the valid packet produces output.
        let ev = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let MediaPayload::Frame(frame) = ev.payload else {
            panic!("expected frame");
        };
        assert_eq!(frame.pts, 1920);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn codec_params_produce_no_output() {
        let decoder = Decoder::new();
        let (tx, rx) = mpsc::channel();
        decoder.set_sink(Arc::new(move |ev: MediaEvent| {
            tx.send(ev).unwrap();
        }));
        decoder.on_data(DecoderInput::CodecParams {
            codec: CodecId::Opus,
            extradata: vec![1, 2, 3],
        });
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
