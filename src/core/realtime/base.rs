//! Base types for the live duplex protocol.
//!
//! This module defines the error taxonomy, the connection state machine and
//! the typed events decoded from the backend's frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during realtime operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Connection to the backend failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The backend sent something the client could not interpret
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// A bounded queue had no room
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation was cancelled by teardown
    #[error("Operation cancelled")]
    Cancelled,

    /// A function call handler returned an error or panicked
    #[error("Handler failed: {0}")]
    HandlerFailed(String),
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Session State
// =============================================================================

/// Connection state of a duplex session.
///
/// Transitions only move forward (`Disconnected → Connecting → Connected →
/// Disconnecting → Disconnected`). `Error` is reachable from anywhere and is
/// left only through an explicit teardown back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self == next || next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
                | (Error, Disconnected)
        )
    }

    #[inline]
    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Disconnecting => write!(f, "Disconnecting"),
            SessionState::Error => write!(f, "Error"),
        }
    }
}

// =============================================================================
// Protocol Events
// =============================================================================

/// Event decoded from the backend, delivered in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Synthesized assistant audio, mono, normalized.
    AudioChunk { samples: Vec<f32>, sample_rate: u32 },
    /// Transcript of the assistant's speech (or its text reply).
    OutputTranscriptDelta { text: String },
    /// Transcript of the user's speech.
    InputTranscriptDelta { text: String },
    /// The backend finished its turn.
    TurnComplete,
    /// The backend stopped generating because the user interrupted.
    Interrupted,
    /// The backend asks the client to run a function.
    FunctionCall {
        call_id: String,
        name: String,
        args: Value,
    },
    /// Previously requested calls that should no longer run.
    FunctionCallCancellation { ids: Vec<String> },
    /// Setup completed; the session accepts media.
    Connected,
    /// The transport is gone.
    Disconnected,
    /// A transport or protocol failure.
    Error { message: String },
}

impl ProtocolEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AudioChunk { .. } => "audio_chunk",
            Self::OutputTranscriptDelta { .. } => "output_transcript_delta",
            Self::InputTranscriptDelta { .. } => "input_transcript_delta",
            Self::TurnComplete => "turn_complete",
            Self::Interrupted => "interrupted",
            Self::FunctionCall { .. } => "function_call",
            Self::FunctionCallCancellation { .. } => "function_call_cancellation",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error { .. } => "error",
        }
    }

    /// Whether the event belongs to assistant output for the current turn.
    pub fn is_assistant_content(&self) -> bool {
        matches!(
            self,
            Self::AudioChunk { .. } | Self::OutputTranscriptDelta { .. } | Self::FunctionCall { .. }
        )
    }
}
