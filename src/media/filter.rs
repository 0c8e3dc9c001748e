//! Resample / rechannel / reformat stage.
//!
//! A filter is built from input parameters plus a textual description in
//! the `aresample=…,asetrate=…,aformat=sample_fmts=…:channel_layouts=…`
//! dialect. The description is parsed once at construction; processing
//! runs on the stage's worker thread and may emit zero or more output
//! frames per input frame (the resampler works in fixed 20 ms chunks and
//! buffers the remainder).

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rubato::{FftFixedIn, Resampler};
use tracing::{debug, warn};

use crate::errors::MediaError;

use super::packet::{
    AudioFrame, ChannelLayout, MediaEvent, MediaPayload, SampleFormat, SinkFn, TimeBase,
};
use super::stage::{spawn_worker, BoundedQueue, DEFAULT_QUEUE_DEPTH};

/// Input format a filter is constructed for. Frames fed to the filter
/// must match it.
#[derive(Debug, Clone, Copy)]
pub struct FilterParams {
    pub sample_rate: u32,
    pub layout: ChannelLayout,
    pub format: SampleFormat,
    pub time_base: TimeBase,
}

/// Parsed form of the filter description.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSpec {
    /// `aresample=N`: target rate for actual resampling.
    pub resample: Option<u32>,
    /// `asetrate=expr`: rate stamped on output frames (a deviation from
    /// the resample target plays the audio faster or slower).
    pub set_rate: Option<u32>,
    /// `aformat=sample_fmts=…`
    pub format: Option<SampleFormat>,
    /// `aformat=…:channel_layouts=…`
    pub layout: Option<ChannelLayout>,
}

impl FilterSpec {
    pub fn parse(desc: &str) -> Result<Self, MediaError> {
        let mut spec = FilterSpec {
            resample: None,
            set_rate: None,
            format: None,
            layout: None,
        };
        for term in desc.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (name, args) = term
                .split_once('=')
                .ok_or_else(|| MediaError::Filter(format!("malformed filter term {term:?}")))?;
            match name {
                "aresample" => {
                    let rate: u32 = args
                        .parse()
                        .map_err(|_| MediaError::Filter(format!("bad aresample rate {args:?}")))?;
                    spec.resample = Some(rate);
                }
                "asetrate" => {
                    spec.set_rate = Some(eval_rate_expr(args)?);
                }
                "aformat" => {
                    for opt in args.split(':') {
                        let (key, value) = opt.split_once('=').ok_or_else(|| {
                            MediaError::Filter(format!("malformed aformat option {opt:?}"))
                        })?;
                        match key {
                            "sample_fmts" => {
                                spec.format = Some(match value {
                                    "s16" => SampleFormat::S16,
                                    "flt" => SampleFormat::F32,
                                    other => {
                                        return Err(MediaError::Filter(format!(
                                            "unsupported sample format {other:?}"
                                        )));
                                    }
                                });
                            }
                            "channel_layouts" => {
                                spec.layout = Some(match value {
                                    "mono" => ChannelLayout::Mono,
                                    "stereo" => ChannelLayout::Stereo,
                                    other => {
                                        return Err(MediaError::Filter(format!(
                                            "unsupported channel layout {other:?}"
                                        )));
                                    }
                                });
                            }
                            other => {
                                return Err(MediaError::Filter(format!(
                                    "unsupported aformat key {other:?}"
                                )));
                            }
                        }
                    }
                }
                other => {
                    return Err(MediaError::Filter(format!("unsupported filter {other:?}")));
                }
            }
        }
        Ok(spec)
    }
}

/// `asetrate` takes a product expression such as `16000*1.0`.
fn eval_rate_expr(expr: &str) -> Result<u32, MediaError> {
    let mut value = 1.0f64;
    for factor in expr.split('*') {
        let f: f64 = factor
            .trim()
            .parse()
            .map_err(|_| MediaError::Filter(format!("bad asetrate factor {factor:?}")))?;
        value *= f;
    }
    if !(1.0..=u32::MAX as f64).contains(&value) {
        return Err(MediaError::Filter(format!("asetrate {expr:?} out of range")));
    }
    Ok(value.round() as u32)
}

pub struct AudioFilter {
    id: Arc<str>,
    queue: Arc<BoundedQueue<AudioFrame>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<Mutex<Option<SinkFn>>>,
    params: FilterParams,
    spec: FilterSpec,
}

impl AudioFilter {
    pub fn new(params: FilterParams, desc: &str) -> Result<Self, MediaError> {
        let spec = FilterSpec::parse(desc)?;
        let id: Arc<str> = uuid::Uuid::new_v4().to_string().into();
        debug!(%id, ?spec, in_rate = params.sample_rate, "filter created");
        Ok(Self {
            queue: Arc::new(BoundedQueue::new(&format!("filter-{id}"), DEFAULT_QUEUE_DEPTH)),
            worker: Mutex::new(None),
            sink: Arc::new(Mutex::new(None)),
            params,
            spec,
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
        self.queue.push(frame);
    }

    fn ensure_worker(&self) {
        let mut guard = self.worker.lock();
        if guard.is_some() {
            return;
        }
        let queue = self.queue.clone();
        let sink = self.sink.clone();
        let id = self.id.clone();
        let mut state = FilterState::new(self.params, self.spec);
        *guard = Some(spawn_worker("audio-filter", queue, move |frame| {
            match state.process(frame) {
                Ok(frames) => {
                    if let Some(sink) = sink.lock().clone() {
                        for frame in frames {
                            sink(MediaEvent {
                                source_id: id.clone(),
                                payload: MediaPayload::Frame(frame),
                            });
                        }
                    }
                }
                Err(e) => warn!(filter = %id, error = %e, "frame dropped"),
            }
        }));
    }
}

impl Drop for AudioFilter {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.worker.lock().take() {
            if std::thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
        debug!(filter = %self.id, "filter destroyed");
    }
}

/// Worker-side processing state.
struct FilterState {
    params: FilterParams,
    /// Rate resampling actually targets.
    out_rate: u32,
    /// Rate stamped on emitted frames (`asetrate` override).
    declared_rate: u32,
    out_layout: ChannelLayout,
    out_format: SampleFormat,
    out_time_base: TimeBase,
    resampler: Option<FftFixedIn<f32>>,
    /// Input chunk the resampler consumes per call: 20 ms.
    chunk_in: usize,
    /// Per-channel accumulation buffers at the input rate.
    pending: Vec<Vec<f32>>,
    /// Output pts accounting, in the sink time base.
    next_pts: Option<i64>,
    current_tag: u64,
}

impl FilterState {
    fn new(params: FilterParams, spec: FilterSpec) -> Self {
        let out_rate = spec.resample.unwrap_or(params.sample_rate);
        let declared_rate = spec.set_rate.unwrap_or(out_rate);
        let out_layout = spec.layout.unwrap_or(params.layout);
        let out_format = spec.format.unwrap_or(params.format);
        let chunk_in = (params.sample_rate as usize / 50).max(1);
        Self {
            params,
            out_rate,
            declared_rate,
            out_layout,
            out_format,
            out_time_base: TimeBase::new(1, declared_rate),
            resampler: None,
            chunk_in,
            pending: vec![Vec::new(); params.layout.channels()],
            next_pts: None,
            current_tag: 0,
        }
    }

    fn process(&mut self, frame: AudioFrame) -> Result<Vec<AudioFrame>, MediaError> {
        self.current_tag = frame.tag;
        if self.next_pts.is_none() {
            // Anchor output timing on the first input frame.
            self.next_pts = Some(frame.time_base.rescale(frame.pts, self.out_time_base));
        }

        if self.params.sample_rate == self.out_rate {
            // No resampling; rechannel/reformat the frame as one unit.
            let samples = frame.samples_f32();
            let mixed = remix(&samples, self.params.layout, self.out_layout);
            return Ok(vec![self.emit(&mixed)]);
        }

        // De-interleave into the per-channel pending buffers.
        let samples = frame.samples_f32();
        let channels = self.params.layout.channels();
        for (i, sample) in samples.iter().enumerate() {
            self.pending[i % channels].push(*sample);
        }

        let mut out = Vec::new();
        while self.pending[0].len() >= self.chunk_in {
            if self.resampler.is_none() {
                // Split even chunks for smaller FFTs; odd chunk sizes run
                // as a single sub-chunk.
                let sub_chunks = if self.chunk_in % 2 == 0 { 2 } else { 1 };
                let resampler = FftFixedIn::<f32>::new(
                    self.params.sample_rate as usize,
                    self.out_rate as usize,
                    self.chunk_in,
                    sub_chunks,
                    channels,
                )
                .map_err(|e| MediaError::Filter(format!("resampler init: {e}")))?;
                self.resampler = Some(resampler);
            }
            let resampler = self.resampler.as_mut().expect("resampler initialized");

            let chunk_in = self.chunk_in;
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..chunk_in).collect())
                .collect();
            let resampled = resampler
                .process(&chunk, None)
                .map_err(|e| MediaError::Filter(format!("resample: {e}")))?;

            // Re-interleave the resampler output.
            let out_len = resampled[0].len();
            let mut interleaved = Vec::with_capacity(out_len * channels);
            for i in 0..out_len {
                for ch in &resampled {
                    interleaved.push(ch[i]);
                }
            }
            let mixed = remix(&interleaved, self.params.layout, self.out_layout);
            out.push(self.emit(&mixed));
        }
        Ok(out)
    }

    fn emit(&mut self, interleaved: &[f32]) -> AudioFrame {
        let nb_samples = interleaved.len() / self.out_layout.channels();
        let pts = self.next_pts.unwrap_or(0);
        self.next_pts = Some(pts + nb_samples as i64);
        let mut frame = match self.out_format {
            SampleFormat::F32 => AudioFrame::from_f32(
                interleaved,
                self.declared_rate,
                self.out_layout,
                pts,
                self.out_time_base,
            ),
            SampleFormat::S16 => {
                let ints: Vec<i16> = interleaved
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                    .collect();
                AudioFrame::from_i16(&ints, self.declared_rate, self.out_layout, pts, self.out_time_base)
            }
        };
        frame.tag = self.current_tag;
        frame
    }
}

/// Channel conversion on interleaved f32: stereo to mono averages, mono to stereo
/// duplicates.
fn remix(interleaved: &[f32], from: ChannelLayout, to: ChannelLayout) -> Vec<f32> {
    match (from, to) {
        (a, b) if a == b => interleaved.to_vec(),
        (ChannelLayout::Stereo, ChannelLayout::Mono) => interleaved
            .chunks_exact(2)
            .map(|pair| (pair[0] + pair[1]) * 0.5)
            .collect(),
        (ChannelLayout::Mono, ChannelLayout::Stereo) => {
            let mut out = Vec::with_capacity(interleaved.len() * 2);
            for &s in interleaved {
                out.push(s);
                out.push(s);
            }
            out
        }
        _ => unreachable!("two layouts"),
    }
}

/// Inbound path description: decoded audio to 16 kHz mono s16 for the
/// speech core.
pub const SPEECH_EXPORT_DESC: &str =
    "aresample=16000,asetrate=16000*1.0,aformat=sample_fmts=s16:channel_layouts=mono";

/// Outbound path description: synthesized audio to 48 kHz stereo s16 ahead
/// of the Opus encoder.
pub const OPUS_FEED_DESC: &str = "aresample=48000,aformat=sample_fmts=s16:channel_layouts=stereo";
