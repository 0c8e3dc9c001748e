//! Per-room TTS adapter.
//!
//! Texts queue up behind a dedicated worker that drives the synthesizer
//! one utterance at a time. Synthesized float PCM is chopped into 20 ms
//! frames with a running sample-count pts and pushed through the
//! float-to-Opus sub-pipeline (resample/reformat filter, then the encoder).
//! Every frame of an utterance carries the utterance's task index so the
//! receiver can segment the Opus stream.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::media::filter::OPUS_FEED_DESC;
use crate::media::{
    AudioEncoder, AudioFilter, AudioFrame, ChannelLayout, EncodedPacket, EncoderConfig,
    FilterParams, MediaEvent, MediaPayload, SampleFormat, TimeBase,
};
use crate::media::stage::{spawn_worker, BoundedQueue};

use super::SpeechSynthesizer;

/// Frame length fed into the sub-pipeline.
const FRAME_DURATION_MS: u32 = 20;
/// Text backlog cap; far above anything a conversation produces.
const TEXT_QUEUE_DEPTH: usize = 256;

/// Receives each encoded Opus packet of a synthesized utterance; the
/// packet's `tag` is the task index.
pub type OpusPacketSink = Arc<dyn Fn(EncodedPacket) + Send + Sync>;

pub struct TtsAdapter {
    user_id: String,
    queue: Arc<BoundedQueue<String>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TtsAdapter {
    pub fn new(user_id: &str, engine: Arc<dyn SpeechSynthesizer>, sink: OpusPacketSink) -> Self {
        let queue = Arc::new(BoundedQueue::new(
            &format!("tts-{user_id}"),
            TEXT_QUEUE_DEPTH,
        ));
        let worker = {
            let queue = queue.clone();
            let user_id = user_id.to_string();
            let mut state = SynthesisState::new(user_id.clone(), engine, sink);
            spawn_worker("tts-synthesis", queue, move |text: String| state.handle_text(&text))
        };
        info!(%user_id, "tts adapter created");
        Self {
            user_id: user_id.to_string(),
            queue,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn input_text(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.queue.push(text.to_string());
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for TtsAdapter {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.worker.lock().take() {
            if std::thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
        info!(user_id = %self.user_id, "tts adapter destroyed");
    }
}

/// Worker-side synthesis driver plus the lazily built sub-pipeline.
struct SynthesisState {
    user_id: String,
    engine: Arc<dyn SpeechSynthesizer>,
    sink: OpusPacketSink,
    pipeline: Option<PcmToOpus>,
    /// Running pts in input-sample units; advances by one frame per chunk.
    next_pts: i64,
    /// Increments once per input text; 1-based so a zero tag means
    /// "no task".
    task_index: u64,
}

impl SynthesisState {
    fn new(user_id: String, engine: Arc<dyn SpeechSynthesizer>, sink: OpusPacketSink) -> Self {
        Self {
            user_id,
            engine,
            sink,
            pipeline: None,
            next_pts: 0,
            task_index: 0,
        }
    }

    fn handle_text(&mut self, text: &str) {
        if let Err(e) = self.engine.init() {
            warn!(user_id = %self.user_id, error = %e, "synthesizer init failed, text dropped");
            return;
        }
        let audio = match self.engine.synthesize(text) {
            Ok(audio) => audio,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "synthesis failed, text dropped");
                return;
            }
        };
        if audio.samples.is_empty() || audio.sample_rate == 0 {
            warn!(user_id = %self.user_id, "synthesizer returned empty audio, text dropped");
            return;
        }

        self.task_index += 1;
        let samples_per_frame = (audio.sample_rate * FRAME_DURATION_MS / 1000) as usize;
        if audio.samples.len() < samples_per_frame {
            warn!(
                user_id = %self.user_id,
                samples = audio.samples.len(),
                "utterance shorter than one frame, dropped"
            );
            return;
        }
        debug!(
            user_id = %self.user_id,
            task = self.task_index,
            rate = audio.sample_rate,
            samples = audio.samples.len(),
            "utterance synthesized"
        );

        let pipeline = self.pipeline.get_or_insert_with(|| {
            PcmToOpus::new(audio.sample_rate, self.sink.clone())
        });
        let time_base = TimeBase::new(1, audio.sample_rate);
        // The trailing sub-frame remainder is discarded.
        for chunk in audio.samples.chunks_exact(samples_per_frame) {
            self.next_pts += samples_per_frame as i64;
            let mut frame = AudioFrame::from_f32(
                chunk,
                audio.sample_rate,
                ChannelLayout::Mono,
                self.next_pts,
                time_base,
            );
            frame.tag = self.task_index;
            pipeline.on_frame(frame);
        }
    }
}

/// Float mono at the engine rate, resampled to 48 kHz stereo s16, then
/// Opus at 32 kb/s.
///
/// Field order is shutdown order: the filter joins first so nothing feeds
/// the encoder while it drains.
struct PcmToOpus {
    filter: AudioFilter,
    _encoder: Arc<AudioEncoder>,
}

impl PcmToOpus {
    fn new(input_rate: u32, sink: OpusPacketSink) -> Self {
        let encoder = Arc::new(
            AudioEncoder::new(EncoderConfig::voice_opus()).expect("voice opus config is valid"),
        );
        encoder.set_sink(Arc::new(move |ev: MediaEvent| {
            if let MediaPayload::Packet(packet) = ev.payload {
                sink(packet);
            }
        }));

        let params = FilterParams {
            sample_rate: input_rate,
            layout: ChannelLayout::Mono,
            format: SampleFormat::F32,
            time_base: TimeBase::new(1, input_rate),
        };
        let filter = AudioFilter::new(params, OPUS_FEED_DESC).expect("static opus feed description");
        {
            let encoder = encoder.clone();
            filter.set_sink(Arc::new(move |ev: MediaEvent| {
                if let MediaPayload::Frame(frame) = ev.payload {
                    encoder.on_data(frame);
                }
            }));
        }
        Self {
            filter,
            _encoder: encoder,
        }
    }

    fn on_frame(&self, frame: AudioFrame) {
        self.filter.on_data(frame);
    }
}
