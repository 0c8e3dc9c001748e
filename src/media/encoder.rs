//! Opus encoding stage.
//!
//! Input frames of any size land in a sample FIFO; the worker drains it in
//! codec-sized chunks (960 samples, 20 ms at 48 kHz) and emits packets
//! with strictly increasing pts. A `flush` input pads the trailing partial
//! frame with silence and encodes it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::MediaError;

use super::packet::{
    AudioFrame, ChannelLayout, CodecId, EncodedPacket, MediaEvent, MediaPayload, SampleFormat,
    SinkFn, TimeBase,
};
use super::stage::{spawn_worker, BoundedQueue, DEFAULT_QUEUE_DEPTH};

#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    pub codec: CodecId,
    pub sample_rate: u32,
    pub layout: ChannelLayout,
    /// Bits per second.
    pub bitrate: i32,
    pub format: SampleFormat,
    /// Samples per channel per encoded packet.
    pub frame_size: usize,
}

impl EncoderConfig {
    /// The outbound voice path: Opus, 48 kHz stereo s16, 32 kb/s, 20 ms.
    pub fn voice_opus() -> Self {
        Self {
            codec: CodecId::Opus,
            sample_rate: 48_000,
            layout: ChannelLayout::Stereo,
            bitrate: 32_000,
            format: SampleFormat::S16,
            frame_size: 960,
        }
    }
}

/// Queue entries: a frame, or `Flush` to drain the FIFO.
enum EncoderInput {
    Frame(AudioFrame),
    Flush,
}

pub struct AudioEncoder {
    id: Arc<str>,
    config: EncoderConfig,
    queue: Arc<BoundedQueue<EncoderInput>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<Mutex<Option<SinkFn>>>,
}

impl AudioEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self, MediaError> {
        if config.frame_size == 0 {
            return Err(MediaError::CodecOpen("frame_size must be positive".into()));
        }
        if config.format != SampleFormat::S16 {
            return Err(MediaError::CodecOpen(
                "opus encoder expects s16 input".into(),
            ));
        }
        let id: Arc<str> = uuid::Uuid::new_v4().to_string().into();
        debug!(%id, rate = config.sample_rate, bitrate = config.bitrate, "encoder created");
        Ok(Self {
            queue: Arc::new(BoundedQueue::new(&format!("encoder-{id}"), DEFAULT_QUEUE_DEPTH)),
            worker: Mutex::new(None),
            sink: Arc::new(Mutex::new(None)),
            config,
            id,
        })
    }

    pub fn id(&self) -> Arc<str> {
        self.id.clone()
    }

    pub fn set_sink(&self, sink: SinkFn) {
        *self.sink.lock() = Some(sink);
    }

    pub fn on_data(&self, frame: AudioFrame) {
        self.ensure_worker();
        self.queue.push(EncoderInput::Frame(frame));
    }

    /// Drain: the buffered remainder is padded to one frame and emitted.
    pub fn flush(&self) {
        self.ensure_worker();
        self.queue.push(EncoderInput::Flush);
    }

    fn ensure_worker(&self) {
        let mut guard = self.worker.lock();
        if guard.is_some() {
            return;
        }
        let queue = self.queue.clone();
        let sink = self.sink.clone();
        let id = self.id.clone();
        let mut state = EncodeState::new(self.config);
        *guard = Some(spawn_worker("opus-encoder", queue, move |input| {
            match state.process(input) {
                Ok(packets) => {
                    if let Some(sink) = sink.lock().clone() {
                        for packet in packets {
                            sink(MediaEvent {
                                source_id: id.clone(),
                                payload: MediaPayload::Packet(packet),
                            });
                        }
                    }
                }
                Err(e) => warn!(encoder = %id, error = %e, "frame dropped"),
            }
        }));
    }
}

impl Drop for AudioEncoder {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.worker.lock().take() {
            if std::thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
        debug!(encoder = %self.id, "encoder destroyed");
    }
}

struct EncodeState {
    config: EncoderConfig,
    codec: Option<opus::Encoder>,
    /// Interleaved s16 FIFO aligning arbitrary input frames to
    /// `frame_size` chunks.
    fifo: VecDeque<i16>,
    /// pts of the first unconsumed FIFO sample, in the output time base.
    pending_pts: i64,
    last_emitted_pts: Option<i64>,
    current_tag: u64,
    time_base: TimeBase,
}

impl EncodeState {
    fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            codec: None,
            fifo: VecDeque::new(),
            pending_pts: 0,
            last_emitted_pts: None,
            current_tag: 0,
            time_base: TimeBase::new(1, config.sample_rate),
        }
    }

    fn process(&mut self, input: EncoderInput) -> Result<Vec<EncodedPacket>, MediaError> {
        match input {
            EncoderInput::Frame(frame) => {
                if self.fifo.is_empty() {
                    self.pending_pts = frame.time_base.rescale(frame.pts, self.time_base);
                }
                self.current_tag = frame.tag;
                for s in frame.samples_i16() {
                    self.fifo.push_back(s);
                }
                self.drain(false)
            }
            EncoderInput::Flush => self.drain(true),
        }
    }

    fn drain(&mut self, flush: bool) -> Result<Vec<EncodedPacket>, MediaError> {
        let channels = self.config.layout.channels();
        let chunk = self.config.frame_size * channels;

        if flush && !self.fifo.is_empty() {
            // Pad the trailing partial frame with silence.
            let rem = self.fifo.len() % chunk;
            if rem != 0 {
                self.fifo.extend(std::iter::repeat(0i16).take(chunk - rem));
            }
        }

        let mut out = Vec::new();
        while self.fifo.len() >= chunk {
            if self.codec.is_none() {
                let channels_cfg = match self.config.layout {
                    ChannelLayout::Mono => opus::Channels::Mono,
                    ChannelLayout::Stereo => opus::Channels::Stereo,
                };
                let mut encoder = opus::Encoder::new(
                    self.config.sample_rate,
                    channels_cfg,
                    opus::Application::Audio,
                )
                .map_err(|e| MediaError::CodecOpen(format!("opus encoder: {e}")))?;
                encoder
                    .set_bitrate(opus::Bitrate::Bits(self.config.bitrate))
                    .map_err(|e| MediaError::CodecOpen(format!("set_bitrate: {e}")))?;
                self.codec = Some(encoder);
                debug!(bitrate = self.config.bitrate, "opus codec opened");
            }
            let codec = self.codec.as_mut().expect("codec opened above");

            let pcm: Vec<i16> = self.fifo.drain(..chunk).collect();
            let data = codec
                .encode_vec(&pcm, 4000)
                .map_err(|e| MediaError::Encode(e.to_string()))?;

            // Strictly increasing pts: a candidate at or behind the last
            // emitted timestamp is bumped one frame past it.
            let mut pts = self.pending_pts;
            if let Some(last) = self.last_emitted_pts {
                if pts <= last {
                    pts = last + self.config.frame_size as i64;
                }
            }
            self.last_emitted_pts = Some(pts);
            self.pending_pts = pts + self.config.frame_size as i64;

            out.push(EncodedPacket {
                codec: self.config.codec,
                data,
                pts,
                time_base: self.time_base,
                tag: self.current_tag,
            });
        }
        Ok(out)
    }
}
