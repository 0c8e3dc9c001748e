pub mod decoder;
pub mod encoder;
pub mod filter;
pub mod packet;
pub mod stage;

pub use decoder::{Decoder, DecoderInput};
pub use encoder::{AudioEncoder, EncoderConfig};
pub use filter::{AudioFilter, FilterParams};
pub use packet::{
    AudioFrame, ChannelLayout, CodecId, EncodedPacket, MediaEvent, MediaPayload, SampleFormat,
    SinkFn, TimeBase,
};
pub use stage::BoundedQueue;
