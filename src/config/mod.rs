//! Configuration module for the duplex voice engine
//!
//! Configuration comes from `.env` files, environment variables and an optional YAML
//! file. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//!
//! # Example
//! ```rust,no_run
//! use waav_duplex::config::DuplexConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = DuplexConfig::from_env()?;
//!
//! // Load from YAML file with environment variables as the base
//! let config = DuplexConfig::from_file(&PathBuf::from("duplex.yaml"))?;
//! println!("Using model {}", config.model);
//! # Ok(())
//! # }
//! ```

use std::env;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use zeroize::Zeroizing;

mod yaml;

pub use yaml::{AssemblerYaml, AudioYaml, BackendYaml, SessionYaml, YamlConfig};

use crate::core::audio::PlaybackConfig;
use crate::core::audio::playback::{
    DEFAULT_BUFFER_SECONDS, DEFAULT_MAX_FRAMES_PER_CALLBACK, DEFAULT_OUTPUT_SAMPLE_RATE,
    DEFAULT_WATERMARK,
};
use crate::core::packets::AssemblerConfig;
use crate::core::packets::assembler::{DEFAULT_FALLBACK_FLUSH, DEFAULT_FALLBACK_MIN_CHARS};
use crate::core::realtime::config::{
    DEFAULT_CLOSE_TIMEOUT, DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_OUTBOUND_QUEUE_CAPACITY,
};
use crate::core::realtime::{
    DEFAULT_CAPTURE_SAMPLE_RATE, DEFAULT_LIVE_MODEL, GEMINI_LIVE_URL, LIVE_OUTPUT_SAMPLE_RATE,
    LiveVoice, ProtocolClientConfig, ResponseModality,
};
use crate::session::orchestrator::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_EVENTS_PER_TICK, DEFAULT_RELEASE_QUEUE_CAPACITY,
};
use crate::session::OrchestratorConfig;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    Read(String),
    #[error("{0}")]
    Parse(String),
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Fully resolved engine configuration.
#[derive(Clone)]
pub struct DuplexConfig {
    // Backend
    pub url: String,
    pub api_key: Zeroizing<String>,
    pub model: String,
    pub voice: LiveVoice,
    pub response_modality: ResponseModality,
    pub system_instruction: Option<String>,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub tools: Vec<Value>,

    // Audio
    pub capture_sample_rate: u32,
    pub playback_source_rate: u32,
    pub playback_output_rate: u32,
    pub watermark: Duration,
    pub buffer_seconds: f32,
    pub max_frames_per_callback: usize,
    pub output_channels: u16,

    // Assembler
    pub fallback_flush: Duration,
    pub fallback_min_chars: usize,

    // Session
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
    pub event_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub max_events_per_tick: usize,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            url: GEMINI_LIVE_URL.to_string(),
            api_key: Zeroizing::new(String::new()),
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice: LiveVoice::default(),
            response_modality: ResponseModality::default(),
            system_instruction: None,
            input_transcription: true,
            output_transcription: true,
            tools: Vec::new(),
            capture_sample_rate: DEFAULT_CAPTURE_SAMPLE_RATE,
            playback_source_rate: LIVE_OUTPUT_SAMPLE_RATE,
            playback_output_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
            watermark: DEFAULT_WATERMARK,
            buffer_seconds: DEFAULT_BUFFER_SECONDS,
            max_frames_per_callback: DEFAULT_MAX_FRAMES_PER_CALLBACK,
            output_channels: 2,
            fallback_flush: DEFAULT_FALLBACK_FLUSH,
            fallback_min_chars: DEFAULT_FALLBACK_MIN_CHARS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_events_per_tick: DEFAULT_MAX_EVENTS_PER_TICK,
        }
    }
}

impl std::fmt::Debug for DuplexConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("response_modality", &self.response_modality)
            .field("capture_sample_rate", &self.capture_sample_rate)
            .field("playback_source_rate", &self.playback_source_rate)
            .field("playback_output_rate", &self.playback_output_rate)
            .field("watermark", &self.watermark)
            .field("output_channels", &self.output_channels)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl DuplexConfig {
    /// Load configuration from environment variables on top of the defaults.
    ///
    /// Recognized variables: `GEMINI_API_KEY` (or `WAAV_DUPLEX_API_KEY`), and
    /// `WAAV_DUPLEX_URL`, `WAAV_DUPLEX_MODEL`, `WAAV_DUPLEX_VOICE`,
    /// `WAAV_DUPLEX_RESPONSE_MODALITY`, `WAAV_DUPLEX_SYSTEM_INSTRUCTION`,
    /// `WAAV_DUPLEX_CAPTURE_SAMPLE_RATE`, `WAAV_DUPLEX_PLAYBACK_OUTPUT_RATE`,
    /// `WAAV_DUPLEX_WATERMARK_MS`, `WAAV_DUPLEX_CONNECT_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::env_base()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, using environment variables as the base.
    ///
    /// YAML values override environment variables, which override defaults. The
    /// merged result is validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml_config = YamlConfig::from_file(path)?;
        let mut config = Self::env_base()?;
        config.apply_yaml(yaml_config);
        config.validate()?;
        Ok(config)
    }

    fn env_base() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(key) = env_string("WAAV_DUPLEX_API_KEY").or_else(|| env_string("GEMINI_API_KEY")) {
            config.api_key = Zeroizing::new(key);
        }
        if let Some(url) = env_string("WAAV_DUPLEX_URL") {
            config.url = url;
        }
        if let Some(model) = env_string("WAAV_DUPLEX_MODEL") {
            config.model = model;
        }
        if let Some(voice) = env_string("WAAV_DUPLEX_VOICE") {
            config.voice = LiveVoice::from_str_or_default(&voice);
        }
        if let Some(modality) = env_string("WAAV_DUPLEX_RESPONSE_MODALITY") {
            config.response_modality = ResponseModality::from_str_or_default(&modality);
        }
        if let Some(instruction) = env_string("WAAV_DUPLEX_SYSTEM_INSTRUCTION") {
            config.system_instruction = Some(instruction);
        }
        if let Some(rate) = env_parse::<u32>("WAAV_DUPLEX_CAPTURE_SAMPLE_RATE")? {
            config.capture_sample_rate = rate;
        }
        if let Some(rate) = env_parse::<u32>("WAAV_DUPLEX_PLAYBACK_OUTPUT_RATE")? {
            config.playback_output_rate = rate;
        }
        if let Some(ms) = env_parse::<u64>("WAAV_DUPLEX_WATERMARK_MS")? {
            config.watermark = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("WAAV_DUPLEX_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) {
        if let Some(backend) = yaml.backend {
            if let Some(url) = backend.url {
                self.url = url;
            }
            if let Some(key) = backend.api_key {
                self.api_key = Zeroizing::new(key);
            }
            if let Some(model) = backend.model {
                self.model = model;
            }
            if let Some(voice) = backend.voice {
                self.voice = LiveVoice::from_str_or_default(&voice);
            }
            if let Some(modality) = backend.response_modality {
                self.response_modality = ResponseModality::from_str_or_default(&modality);
            }
            if backend.system_instruction.is_some() {
                self.system_instruction = backend.system_instruction;
            }
            if let Some(enabled) = backend.input_transcription {
                self.input_transcription = enabled;
            }
            if let Some(enabled) = backend.output_transcription {
                self.output_transcription = enabled;
            }
            if let Some(tools) = backend.tools {
                self.tools = tools;
            }
        }

        if let Some(audio) = yaml.audio {
            if let Some(rate) = audio.capture_sample_rate {
                self.capture_sample_rate = rate;
            }
            if let Some(rate) = audio.playback_source_rate {
                self.playback_source_rate = rate;
            }
            if let Some(rate) = audio.playback_output_rate {
                self.playback_output_rate = rate;
            }
            if let Some(ms) = audio.watermark_ms {
                self.watermark = Duration::from_millis(ms);
            }
            if let Some(seconds) = audio.buffer_seconds {
                self.buffer_seconds = seconds;
            }
            if let Some(frames) = audio.max_frames_per_callback {
                self.max_frames_per_callback = frames;
            }
            if let Some(channels) = audio.output_channels {
                self.output_channels = channels;
            }
        }

        if let Some(assembler) = yaml.assembler {
            if let Some(ms) = assembler.fallback_flush_ms {
                self.fallback_flush = Duration::from_millis(ms);
            }
            if let Some(chars) = assembler.fallback_min_chars {
                self.fallback_min_chars = chars;
            }
        }

        if let Some(session) = yaml.session {
            if let Some(ms) = session.connect_timeout_ms {
                self.connect_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = session.close_timeout_ms {
                self.close_timeout = Duration::from_millis(ms);
            }
            if let Some(capacity) = session.event_queue_capacity {
                self.event_queue_capacity = capacity;
            }
            if let Some(capacity) = session.outbound_queue_capacity {
                self.outbound_queue_capacity = capacity;
            }
            if let Some(max) = session.max_events_per_tick {
                self.max_events_per_tick = max;
            }
        }
    }

    /// Check that the resolved values can drive a session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "API key is required (set GEMINI_API_KEY or backend.api_key)".to_string(),
            ));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                name: "backend.url".to_string(),
                value: self.url.clone(),
            });
        }
        for (name, rate) in [
            ("audio.capture_sample_rate", self.capture_sample_rate),
            ("audio.playback_source_rate", self.playback_source_rate),
            ("audio.playback_output_rate", self.playback_output_rate),
        ] {
            if rate == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: rate.to_string(),
                });
            }
        }
        if !(self.buffer_seconds.is_finite() && self.buffer_seconds > 0.0) {
            return Err(ConfigError::InvalidValue {
                name: "audio.buffer_seconds".to_string(),
                value: self.buffer_seconds.to_string(),
            });
        }
        if self.output_channels == 0 {
            return Err(ConfigError::InvalidValue {
                name: "audio.output_channels".to_string(),
                value: "0".to_string(),
            });
        }
        for (name, value) in [
            ("audio.max_frames_per_callback", self.max_frames_per_callback),
            ("session.event_queue_capacity", self.event_queue_capacity),
            ("session.outbound_queue_capacity", self.outbound_queue_capacity),
            ("session.max_events_per_tick", self.max_events_per_tick),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: "0".to_string(),
                });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Component Configs
    // =========================================================================

    pub fn protocol_config(&self) -> ProtocolClientConfig {
        ProtocolClientConfig {
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            voice: self.voice,
            response_modality: self.response_modality,
            system_instruction: self.system_instruction.clone(),
            input_transcription: self.input_transcription,
            output_transcription: self.output_transcription,
            tools: self.tools.clone(),
            capture_sample_rate: self.capture_sample_rate,
            event_queue_capacity: self.event_queue_capacity,
            outbound_queue_capacity: self.outbound_queue_capacity,
            close_timeout: self.close_timeout,
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            source_sample_rate: self.playback_source_rate,
            output_sample_rate: self.playback_output_rate,
            watermark: self.watermark,
            buffer_seconds: self.buffer_seconds,
            max_frames_per_callback: self.max_frames_per_callback,
        }
    }

    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            fallback_flush: self.fallback_flush,
            fallback_min_chars: self.fallback_min_chars,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            protocol: self.protocol_config(),
            playback: self.playback_config(),
            assembler: self.assembler_config(),
            connect_timeout: self.connect_timeout,
            max_events_per_tick: self.max_events_per_tick,
            release_queue_capacity: DEFAULT_RELEASE_QUEUE_CAPACITY,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value: raw,
            }),
        None => Ok(None),
    }
}
