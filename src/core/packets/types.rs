//! Packet value types shared by the assembler, the release gate and consumers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    /// A sentence (or fallback fragment) of transcript plus the audio received with it.
    TextAudio,
    /// A function call requested by the backend.
    FunctionCall,
}

impl PacketKind {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextAudio => "text_audio",
            Self::FunctionCall => "function_call",
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Function call details attached to a [`PacketKind::FunctionCall`] packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallInfo {
    pub name: String,
    /// Opaque JSON arguments as sent by the backend.
    pub args: Value,
    pub call_id: String,
}

/// One ordered unit of assistant output.
///
/// Packets within a turn are ordered by `sequence` (starting at 0); turns are
/// ordered by `turn_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPacket {
    pub kind: PacketKind,
    pub turn_id: u64,
    pub sequence: u32,
    #[serde(default)]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCallInfo>,
    #[serde(default)]
    pub is_turn_end: bool,
}

impl SyncPacket {
    /// Ordering key across all turns.
    #[inline]
    pub fn order_key(&self) -> (u64, u32) {
        (self.turn_id, self.sequence)
    }

    /// Duration of attached audio at `sample_rate`.
    pub fn audio_duration(&self, sample_rate: u32) -> std::time::Duration {
        let samples = self.audio.as_ref().map_or(0, Vec::len);
        std::time::Duration::from_secs_f64(samples as f64 / sample_rate.max(1) as f64)
    }

    pub fn is_function_call(&self) -> bool {
        self.kind == PacketKind::FunctionCall
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialization_skips_empty_fields() {
        let packet = SyncPacket {
            kind: PacketKind::TextAudio,
            turn_id: 3,
            sequence: 1,
            text: "Hello there.".to_string(),
            audio: None,
            function_call: None,
            is_turn_end: false,
        };

        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["kind"], "text_audio");
        assert_eq!(value["turn_id"], 3);
        assert!(value.get("audio").is_none());
        assert!(value.get("function_call").is_none());
    }

    #[test]
    fn test_function_call_packet() {
        let packet = SyncPacket {
            kind: PacketKind::FunctionCall,
            turn_id: 1,
            sequence: 0,
            text: String::new(),
            audio: None,
            function_call: Some(FunctionCallInfo {
                name: "wave".to_string(),
                args: json!({"hand": "left"}),
                call_id: "call-1".to_string(),
            }),
            is_turn_end: false,
        };
        assert!(packet.is_function_call());
        assert_eq!(packet.order_key(), (1, 0));
        assert_eq!(packet.kind.to_string(), "function_call");
    }

    #[test]
    fn test_audio_duration() {
        let packet = SyncPacket {
            kind: PacketKind::TextAudio,
            turn_id: 1,
            sequence: 0,
            text: String::new(),
            audio: Some(vec![0.0; 12_000]),
            function_call: None,
            is_turn_end: true,
        };
        assert_eq!(
            packet.audio_duration(24_000),
            std::time::Duration::from_millis(500)
        );
    }
}
