//! Events surfaced by [`SessionOrchestrator::tick`](super::SessionOrchestrator::tick).

use serde::Serialize;

use crate::core::packets::SyncPacket;
use crate::core::realtime::SessionState;

/// Something the session consumer should react to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session state changed. Fired only when the value actually changes.
    StateChanged { from: SessionState, to: SessionState },
    /// The assistant began a new response turn.
    AssistantSpeakingStarted { turn_id: u64 },
    /// The assistant's turn ended: either its audio fully played out or it was
    /// cut short by barge-in, a server interruption or teardown.
    AssistantSpeakingStopped { turn_id: u64, interrupted: bool },
    UserSpeakingStarted,
    UserSpeakingStopped,
    /// A released packet, in strict `(turn_id, sequence)` order.
    Packet(SyncPacket),
    /// Transcript of the user's speech.
    InputTranscript { text: String },
    /// The backend withdrew function calls it asked for earlier.
    FunctionCallCancelled { ids: Vec<String> },
    Error { message: String },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::AssistantSpeakingStarted { .. } => "assistant_speaking_started",
            Self::AssistantSpeakingStopped { .. } => "assistant_speaking_stopped",
            Self::UserSpeakingStarted => "user_speaking_started",
            Self::UserSpeakingStopped => "user_speaking_stopped",
            Self::Packet(_) => "packet",
            Self::InputTranscript { .. } => "input_transcript",
            Self::FunctionCallCancelled { .. } => "function_call_cancelled",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = SessionEvent::StateChanged {
            from: SessionState::Connecting,
            to: SessionState::Connected,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "state_changed");
        assert_eq!(value["from"], "connecting");
        assert_eq!(value["to"], "connected");

        let value = serde_json::to_value(SessionEvent::UserSpeakingStarted).unwrap();
        assert_eq!(value["type"], "user_speaking_started");
    }
}
