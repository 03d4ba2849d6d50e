//! Live API WebSocket message types.
//!
//! All messages are JSON objects whose single top-level key names the message.
//!
//! Client messages (sent to server):
//! - setup - Session configuration, first message on the socket
//! - realtimeInput - Captured audio chunks and end-of-stream markers
//! - clientContent - Text turns
//! - toolResponse - Results of function calls
//!
//! Server messages (received from server):
//! - setupComplete - Handshake finished
//! - serverContent - Model output, transcriptions and turn signals
//! - toolCall - Function calls to run
//! - toolCallCancellation - Function calls to abandon
//! - goAway - Server will close the connection soon
//! - usageMetadata - Token accounting
//!
//! Servers may combine several keys in one frame, so server messages are
//! decoded as a struct of optional parts rather than a tagged enum.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::base::ProtocolEvent;
use super::config::{LIVE_OUTPUT_SAMPLE_RATE, ProtocolClientConfig, ResponseModality};
use crate::core::audio::pcm;

// =============================================================================
// Shared Content Types
// =============================================================================

/// Base64 payload with its MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// One part of a content turn: text or inline media.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// A role-tagged list of parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }
}

/// Empty object used to switch on optional features (`{}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enabled {}

// =============================================================================
// Client Messages
// =============================================================================

/// Messages sent from the client to the backend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Enabled>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Enabled>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_chunks: Option<Vec<Blob>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

impl ClientMessage {
    /// Build the handshake message from a client configuration.
    pub fn setup(config: &ProtocolClientConfig) -> Self {
        let speech_config = match config.response_modality {
            ResponseModality::Audio => Some(SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: config.voice.as_str().to_string(),
                    },
                },
            }),
            ResponseModality::Text => None,
        };

        Self::Setup(Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality],
                speech_config,
            },
            system_instruction: config
                .system_instruction
                .as_ref()
                .filter(|s| !s.trim().is_empty())
                .map(|s| Content {
                    role: None,
                    parts: vec![Part {
                        text: Some(s.clone()),
                        inline_data: None,
                    }],
                }),
            input_audio_transcription: config.input_transcription.then(Enabled::default),
            output_audio_transcription: config.output_transcription.then(Enabled::default),
            tools: config.tools.clone(),
        })
    }

    /// Wrap captured samples as a base64 PCM16 media chunk.
    pub fn audio(samples: &[f32], sample_rate: u32) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: Some(vec![Blob {
                mime_type: pcm::pcm_mime_type(sample_rate),
                data: pcm::encode_base64_pcm(samples),
            }]),
            audio_stream_end: None,
        })
    }

    /// Signal that capture paused and buffered audio should be flushed.
    pub fn audio_stream_end() -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: None,
            audio_stream_end: Some(true),
        })
    }

    pub fn text(text: impl Into<String>, turn_complete: bool) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content::user_text(text)],
            turn_complete,
        })
    }

    pub fn tool_response(call_id: impl Into<String>, name: impl Into<String>, response: Value) -> Self {
        Self::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id: call_id.into(),
                name: name.into(),
                response,
            }],
        })
    }

    /// Message name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::RealtimeInput(_) => "realtimeInput",
            Self::ClientContent(_) => "clientContent",
            Self::ToolResponse(_) => "toolResponse",
        }
    }
}

// =============================================================================
// Server Messages
// =============================================================================

/// A frame received from the backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub usage_metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub generation_complete: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Translate the frame into protocol events, in the order a consumer
    /// should observe them. A turn boundary, when present, comes last.
    pub fn into_events(self, modality: ResponseModality) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();

        if let Some(go_away) = &self.go_away {
            tracing::warn!(
                time_left = go_away.time_left.as_deref().unwrap_or("unknown"),
                "Backend announced it will close the connection"
            );
        }
        if let Some(usage) = &self.usage_metadata {
            tracing::trace!(usage = %usage, "Usage metadata");
        }

        if let Some(content) = self.server_content {
            if let Some(text) = content.input_transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(ProtocolEvent::InputTranscriptDelta { text });
                }
            }

            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(blob) = part.inline_data {
                        if let Some(event) = decode_audio_blob(&blob) {
                            events.push(event);
                        }
                    }
                    if let Some(text) = part.text {
                        if modality == ResponseModality::Text && !text.is_empty() {
                            events.push(ProtocolEvent::OutputTranscriptDelta { text });
                        } else {
                            tracing::trace!("Ignoring text part in audio modality");
                        }
                    }
                }
            }

            if let Some(text) = content.output_transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(ProtocolEvent::OutputTranscriptDelta { text });
                }
            }

            if content.generation_complete {
                tracing::trace!("Generation complete");
            }
            if content.interrupted {
                events.push(ProtocolEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(ProtocolEvent::TurnComplete);
            }
        }

        if let Some(tool_call) = self.tool_call {
            for call in tool_call.function_calls {
                events.push(ProtocolEvent::FunctionCall {
                    call_id: call.id.unwrap_or_default(),
                    name: call.name,
                    args: call.args.unwrap_or(Value::Object(Default::default())),
                });
            }
        }

        if let Some(cancellation) = self.tool_call_cancellation {
            events.push(ProtocolEvent::FunctionCallCancellation {
                ids: cancellation.ids,
            });
        }

        events
    }
}

fn decode_audio_blob(blob: &Blob) -> Option<ProtocolEvent> {
    if !pcm::is_pcm_mime(&blob.mime_type) {
        tracing::debug!(mime_type = %blob.mime_type, "Ignoring non-PCM inline data");
        return None;
    }
    match pcm::decode_base64_pcm(&blob.data) {
        Ok(samples) if samples.is_empty() => None,
        Ok(samples) => Some(ProtocolEvent::AudioChunk {
            samples,
            sample_rate: pcm::parse_pcm_rate(&blob.mime_type).unwrap_or(LIVE_OUTPUT_SAMPLE_RATE),
        }),
        Err(e) => {
            tracing::warn!("Failed to decode audio chunk: {}", e);
            None
        }
    }
}
