//! Live backend configuration types.
//!
//! This module contains configuration for the duplex protocol client:
//! - Endpoint and credential
//! - Model, voice and response modality
//! - Transcription and tool declarations passed through the handshake
//! - Queue sizing and close timeout

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use super::base::{RealtimeError, RealtimeResult};

/// Live API WebSocket endpoint.
pub const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default live model.
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Sample rate of captured audio sent upstream.
pub const DEFAULT_CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio produced by the backend.
pub const LIVE_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Response Modality
// =============================================================================

/// What the backend replies with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    #[default]
    Audio,
    Text,
}

impl ResponseModality {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "AUDIO",
            Self::Text => "TEXT",
        }
    }

    /// Parse from string, with fallback to default.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "audio" => Self::Audio,
            "text" => Self::Text,
            _ => Self::default(),
        }
    }
}

impl fmt::Display for ResponseModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Voices
// =============================================================================

/// Prebuilt voices offered by the live backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LiveVoice {
    #[default]
    Puck,
    Charon,
    Kore,
    Fenrir,
    Aoede,
    Leda,
    Orus,
    Zephyr,
}

impl LiveVoice {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Puck => "Puck",
            Self::Charon => "Charon",
            Self::Kore => "Kore",
            Self::Fenrir => "Fenrir",
            Self::Aoede => "Aoede",
            Self::Leda => "Leda",
            Self::Orus => "Orus",
            Self::Zephyr => "Zephyr",
        }
    }

    /// Parse from string, with fallback to default.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "puck" => Self::Puck,
            "charon" => Self::Charon,
            "kore" => Self::Kore,
            "fenrir" => Self::Fenrir,
            "aoede" => Self::Aoede,
            "leda" => Self::Leda,
            "orus" => Self::Orus,
            "zephyr" => Self::Zephyr,
            _ => Self::default(),
        }
    }
}

impl fmt::Display for LiveVoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for a [`ProtocolClient`](super::client::ProtocolClient).
#[derive(Clone)]
pub struct ProtocolClientConfig {
    pub url: String,
    pub api_key: Zeroizing<String>,
    pub model: String,
    pub voice: LiveVoice,
    pub response_modality: ResponseModality,
    pub system_instruction: Option<String>,
    pub input_transcription: bool,
    pub output_transcription: bool,
    /// Opaque tool declarations forwarded verbatim in the setup message.
    pub tools: Vec<Value>,
    pub capture_sample_rate: u32,
    pub event_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub close_timeout: Duration,
}

impl Default for ProtocolClientConfig {
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
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl fmt::Debug for ProtocolClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolClientConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("response_modality", &self.response_modality)
            .field("system_instruction", &self.system_instruction)
            .field("input_transcription", &self.input_transcription)
            .field("output_transcription", &self.output_transcription)
            .field("tools", &self.tools.len())
            .field("capture_sample_rate", &self.capture_sample_rate)
            .field("event_queue_capacity", &self.event_queue_capacity)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("close_timeout", &self.close_timeout)
            .finish()
    }
}

impl ProtocolClientConfig {
    /// Reject configurations the client cannot use.
    pub fn validate(&self) -> RealtimeResult<()> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| RealtimeError::InvalidConfiguration(format!("Invalid URL: {}", e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "URL scheme must be ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(RealtimeError::InvalidConfiguration(
                "API key is required".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(RealtimeError::InvalidConfiguration(
                "Model is required".to_string(),
            ));
        }
        if self.capture_sample_rate == 0 {
            return Err(RealtimeError::InvalidConfiguration(
                "Capture sample rate must be positive".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 || self.outbound_queue_capacity == 0 {
            return Err(RealtimeError::InvalidConfiguration(
                "Queue capacities must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
