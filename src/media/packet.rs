//! Media plane data types.
//!
//! Packets and frames are immutable values once emitted; fan-out between
//! stages clones the (cheaply cloneable) metadata and shares payloads by
//! value. Every stage stamps its own id on what it emits so a sink
//! receiving from several stages can demultiplex.

use std::sync::Arc;

/// Rational timestamp unit, e.g. `(1, 48000)` for 48 kHz sample ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Convert `ts` from this time base into `to`.
    pub fn rescale(&self, ts: i64, to: TimeBase) -> i64 {
        // ts * (num/den) * (to.den/to.num), in i128 to dodge overflow.
        let num = ts as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        (num / den) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// 32-bit float, interleaved.
    F32,
    /// Signed 16-bit, interleaved.
    S16,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::S16 => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SampleFormat::F32 => "flt",
            SampleFormat::S16 => "s16",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn channels(&self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelLayout::Mono => "mono",
            ChannelLayout::Stereo => "stereo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    Opus,
}

/// Uncompressed audio: interleaved samples plus format metadata.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    /// Samples per channel.
    pub nb_samples: usize,
    pub sample_rate: u32,
    pub layout: ChannelLayout,
    pub format: SampleFormat,
    pub pts: i64,
    pub time_base: TimeBase,
    /// Opaque marker carried through the pipeline untouched; the TTS path
    /// stores the task index here.
    pub tag: u64,
}

impl AudioFrame {
    pub fn from_f32(
        samples: &[f32],
        sample_rate: u32,
        layout: ChannelLayout,
        pts: i64,
        time_base: TimeBase,
    ) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 4);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        Self {
            data,
            nb_samples: samples.len() / layout.channels(),
            sample_rate,
            layout,
            format: SampleFormat::F32,
            pts,
            time_base,
            tag: 0,
        }
    }

    pub fn from_i16(
        samples: &[i16],
        sample_rate: u32,
        layout: ChannelLayout,
        pts: i64,
        time_base: TimeBase,
    ) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        Self {
            data,
            nb_samples: samples.len() / layout.channels(),
            sample_rate,
            layout,
            format: SampleFormat::S16,
            pts,
            time_base,
            tag: 0,
        }
    }

    /// Interleaved samples as f32, converting from the stored format.
    pub fn samples_f32(&self) -> Vec<f32> {
        match self.format {
            SampleFormat::F32 => self
                .data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            SampleFormat::S16 => self
                .data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
                .collect(),
        }
    }

    /// Interleaved samples as i16, converting (with clamping) from the
    /// stored format.
    pub fn samples_i16(&self) -> Vec<i16> {
        match self.format {
            SampleFormat::S16 => self
                .data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect(),
            SampleFormat::F32 => self
                .samples_f32()
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                .collect(),
        }
    }
}

/// Compressed audio in or out of a codec.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub codec: CodecId,
    pub data: Vec<u8>,
    pub pts: i64,
    pub time_base: TimeBase,
    pub tag: u64,
}

#[derive(Debug, Clone)]
pub enum MediaPayload {
    Packet(EncodedPacket),
    Frame(AudioFrame),
}

/// What a stage hands to its sink: the payload plus the id of the stage
/// that produced it.
#[derive(Debug, Clone)]
pub struct MediaEvent {
    pub source_id: Arc<str>,
    pub payload: MediaPayload,
}

pub type SinkFn = Arc<dyn Fn(MediaEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_48k_to_16k() {
        let tb48 = TimeBase::new(1, 48000);
        let tb16 = TimeBase::new(1, 16000);
        assert_eq!(tb48.rescale(960, tb16), 320);
        assert_eq!(tb48.rescale(0, tb16), 0);
    }

    #[test]
    fn rescale_ms_to_samples() {
        let ms = TimeBase::new(1, 1000);
        let tb48 = TimeBase::new(1, 48000);
        assert_eq!(ms.rescale(20, tb48), 960);
    }

    #[test]
    fn f32_frame_round_trip() {
        let samples = [0.0f32, 0.5, -0.5, 1.0];
        let frame = AudioFrame::from_f32(&samples, 48000, ChannelLayout::Stereo, 0, TimeBase::new(1, 48000));
        assert_eq!(frame.nb_samples, 2);
        assert_eq!(frame.samples_f32(), samples);
    }

    #[test]
    fn s16_conversion_clamps() {
        let samples = [0.0f32, 2.0, -2.0];
        let frame = AudioFrame::from_f32(&samples, 16000, ChannelLayout::Mono, 0, TimeBase::new(1, 16000));
        let ints = frame.samples_i16();
        assert_eq!(ints[0], 0);
        assert_eq!(ints[1], 32767);
        assert_eq!(ints[2], -32767);
    }

    #[test]
    fn i16_frame_preserves_bytes() {
        let samples = [100i16, -100, 32767, -32768];
        let frame = AudioFrame::from_i16(&samples, 16000, ChannelLayout::Mono, 5, TimeBase::new(1, 16000));
        assert_eq!(frame.samples_i16(), samples);
        assert_eq!(frame.data.len(), 8);
    }
}
