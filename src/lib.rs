pub mod config;
pub mod errors;
pub mod media;
pub mod net;
pub mod room;
pub mod signal;
pub mod tts;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::{WorkerConfig, CONTROL_PORT};
pub use errors::{ConfigError, MediaError, ProtocolError, TransportError};
pub use net::http::ControlServer;
pub use room::RoomManager;
pub use tts::{DisabledSynthesizer, SpeechSynthesizer, TtsAudio};
