//! Text-to-speech seam.
//!
//! The synthesizer itself is an external collaborator: the worker only
//! depends on the [`SpeechSynthesizer`] trait, validates the configured
//! model files at startup and drives whatever engine was injected. The
//! per-room machinery around it (text queue, worker thread, the
//! float-to-Opus sub-pipeline) lives in [`adapter`].

pub mod adapter;

pub use adapter::TtsAdapter;

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::TtsConfig;
use crate::errors::{ConfigError, MediaError};

/// Synthesized audio: interleaved mono float samples at the engine's
/// native rate.
#[derive(Debug, Clone)]
pub struct TtsAudio {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

/// The opaque synthesis engine. `init` is idempotent and may be called
/// once per utterance; `synthesize` runs on the adapter's worker thread
/// and may block.
pub trait SpeechSynthesizer: Send + Sync {
    fn init(&self) -> Result<(), MediaError>;
    fn synthesize(&self, text: &str) -> Result<TtsAudio, MediaError>;
}

/// Engine used when `tts_enable` is off or no real engine is linked in:
/// every utterance fails, which the adapter turns into a warn-and-drop.
pub struct DisabledSynthesizer;

impl SpeechSynthesizer for DisabledSynthesizer {
    fn init(&self) -> Result<(), MediaError> {
        Ok(())
    }

    fn synthesize(&self, _text: &str) -> Result<TtsAudio, MediaError> {
        Err(MediaError::Synthesis("TTS is disabled".into()))
    }
}

/// Validate the `tts_config` section and build the engine for the worker.
///
/// Missing or unreadable model files are fatal at startup. With
/// `tts_enable: false` validation is skipped and a [`DisabledSynthesizer`]
/// is returned.
pub fn engine_from_config(cfg: &TtsConfig) -> Result<Arc<dyn SpeechSynthesizer>, ConfigError> {
    if !cfg.tts_enable {
        info!("TTS disabled by configuration");
        return Ok(Arc::new(DisabledSynthesizer));
    }
    check_file("acoustic_model", &cfg.acoustic_model)?;
    check_file("vocoder", &cfg.vocoder)?;
    check_file("lexicon", &cfg.lexicon)?;
    check_file("tokens", &cfg.tokens)?;
    check_dir("dict_dir", &cfg.dict_dir)?;
    if cfg.num_threads < 1 {
        return Err(ConfigError::Invalid(format!(
            "tts_config.num_threads must be >= 1, got {}",
            cfg.num_threads
        )));
    }
    // Model files check out but this build carries no inference runtime;
    // deployments inject their engine through the room manager instead.
    warn!("TTS enabled but no synthesis engine is linked; utterances will be dropped");
    Ok(Arc::new(DisabledSynthesizer))
}

fn check_file(key: &str, path: &str) -> Result<(), ConfigError> {
    if path.is_empty() {
        return Err(ConfigError::Invalid(format!("tts_config.{key} is not set")));
    }
    if !Path::new(path).is_file() {
        return Err(ConfigError::Invalid(format!(
            "tts_config.{key} file not found: {path}"
        )));
    }
    Ok(())
}

fn check_dir(key: &str, path: &str) -> Result<(), ConfigError> {
    if path.is_empty() {
        return Err(ConfigError::Invalid(format!("tts_config.{key} is not set")));
    }
    if !Path::new(path).is_dir() {
        return Err(ConfigError::Invalid(format!(
            "tts_config.{key} directory not found: {path}"
        )));
    }
    Ok(())
}
