pub mod worker_error;

pub use worker_error::{ConfigError, MediaError, ProtocolError, TransportError};
