//! Worker configuration.
//!
//! A single YAML file, whose path is the sole CLI argument, configures the
//! log output, the remote signalling endpoint and the local TTS engine.
//! Every key has a default so a partial (or empty) file is valid; unknown
//! keys are ignored.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::errors::ConfigError;

/// Port of the local HTTP/WS control endpoint (`POST /echo`, WS upgrades).
pub const CONTROL_PORT: u16 = 9931;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: "voiceagent.log".to_string(),
        }
    }
}

/// The *remote* signalling endpoint the protoo client dials. The local
/// control listener is fixed at `0.0.0.0:{CONTROL_PORT}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_ssl: bool,
    pub subpath: String,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_ssl: false,
            subpath: "/ws".to_string(),
        }
    }
}

impl WsServerConfig {
    pub fn url(&self) -> String {
        let scheme = if self.enable_ssl { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.subpath)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub tts_enable: bool,
    pub acoustic_model: String,
    pub vocoder: String,
    pub lexicon: String,
    pub tokens: String,
    pub dict_dir: String,
    pub num_threads: i32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            tts_enable: false,
            acoustic_model: String::new(),
            vocoder: String::new(),
            lexicon: String::new(),
            tokens: String::new(),
            dict_dir: String::new(),
            num_threads: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub log: LogConfig,
    pub ws_server: WsServerConfig,
    pub tts_config: TtsConfig,
}

impl WorkerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let cfg: WorkerConfig = serde_yaml::from_str(raw)?;
        Ok(cfg)
    }

    /// Human-readable dump of the effective configuration, logged at boot.
    pub fn summary(&self) -> String {
        format!(
            "log: level={} file={}\n\
             ws_server: host={} port={} enable_ssl={} subpath={}\n\
             tts_config: tts_enable={} acoustic_model={} vocoder={} lexicon={} tokens={} dict_dir={} num_threads={}",
            self.log.level,
            self.log.file,
            self.ws_server.host,
            self.ws_server.port,
            self.ws_server.enable_ssl,
            self.ws_server.subpath,
            self.tts_config.tts_enable,
            self.tts_config.acoustic_model,
            self.tts_config.vocoder,
            self.tts_config.lexicon,
            self.tts_config.tokens,
            self.tts_config.dict_dir,
            self.tts_config.num_threads,
        )
    }
}
