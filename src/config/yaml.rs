use serde::Deserialize;
use std::path::Path;

use super::ConfigError;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present in the
/// file override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// backend:
///   url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"
///   api_key: "your-gemini-key"
///   model: "models/gemini-2.0-flash-live-001"
///   voice: "Kore"
///   response_modality: "audio"
///   system_instruction: "You are a friendly assistant."
///   input_transcription: true
///   output_transcription: true
///   tools:
///     - functionDeclarations:
///         - name: "set_light"
///           description: "Switch a light on or off"
///
/// audio:
///   capture_sample_rate: 16000
///   playback_source_rate: 24000
///   playback_output_rate: 48000
///   watermark_ms: 300
///   buffer_seconds: 30
///   max_frames_per_callback: 4096
///   output_channels: 2
///
/// assembler:
///   fallback_flush_ms: 500
///   fallback_min_chars: 20
///
/// session:
///   connect_timeout_ms: 10000
///   close_timeout_ms: 2000
///   event_queue_capacity: 1024
///   outbound_queue_capacity: 256
///   max_events_per_tick: 256
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub backend: Option<BackendYaml>,
    pub audio: Option<AudioYaml>,
    pub assembler: Option<AssemblerYaml>,
    pub session: Option<SessionYaml>,
}

/// Live backend connection settings from YAML
#[derive(Clone, Deserialize, Default)]
#[serde(default)]
pub struct BackendYaml {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Prebuilt voice name, e.g. "Puck" or "Kore"
    pub voice: Option<String>,
    /// "audio" or "text"
    pub response_modality: Option<String>,
    pub system_instruction: Option<String>,
    pub input_transcription: Option<bool>,
    pub output_transcription: Option<bool>,
    /// Tool declarations forwarded verbatim in the setup message
    pub tools: Option<Vec<serde_json::Value>>,
}

impl std::fmt::Debug for BackendYaml {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendYaml")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("response_modality", &self.response_modality)
            .finish_non_exhaustive()
    }
}

/// Audio pipeline settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub capture_sample_rate: Option<u32>,
    pub playback_source_rate: Option<u32>,
    pub playback_output_rate: Option<u32>,
    pub watermark_ms: Option<u64>,
    pub buffer_seconds: Option<f32>,
    pub max_frames_per_callback: Option<usize>,
    pub output_channels: Option<u16>,
}

/// Packet assembler settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AssemblerYaml {
    pub fallback_flush_ms: Option<u64>,
    pub fallback_min_chars: Option<usize>,
}

/// Session timing and queue settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub connect_timeout_ms: Option<u64>,
    pub close_timeout_ms: Option<u64>,
    pub event_queue_capacity: Option<usize>,
    pub outbound_queue_capacity: Option<usize>,
    pub max_events_per_tick: Option<usize>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Read(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
backend:
  url: "ws://localhost:9000"
  api_key: "yaml-key"
  model: "models/test"
  voice: "Kore"
  response_modality: "text"
  system_instruction: "Be brief."
  input_transcription: false
  output_transcription: true
  tools:
    - functionDeclarations:
        - name: "set_light"

audio:
  capture_sample_rate: 16000
  playback_source_rate: 24000
  playback_output_rate: 44100
  watermark_ms: 200
  buffer_seconds: 10
  max_frames_per_callback: 1024
  output_channels: 1

assembler:
  fallback_flush_ms: 750
  fallback_min_chars: 40

session:
  connect_timeout_ms: 5000
  close_timeout_ms: 1000
  event_queue_capacity: 64
  outbound_queue_capacity: 32
  max_events_per_tick: 16
"#;
        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        let backend = config.backend.unwrap();
        assert_eq!(backend.url, Some("ws://localhost:9000".to_string()));
        assert_eq!(backend.api_key, Some("yaml-key".to_string()));
        assert_eq!(backend.voice, Some("Kore".to_string()));
        assert_eq!(backend.response_modality, Some("text".to_string()));
        assert_eq!(backend.input_transcription, Some(false));
        assert_eq!(backend.tools.as_ref().map(Vec::len), Some(1));

        let audio = config.audio.unwrap();
        assert_eq!(audio.playback_output_rate, Some(44100));
        assert_eq!(audio.buffer_seconds, Some(10.0));
        assert_eq!(audio.output_channels, Some(1));

        let assembler = config.assembler.unwrap();
        assert_eq!(assembler.fallback_flush_ms, Some(750));
        assert_eq!(assembler.fallback_min_chars, Some(40));

        let session = config.session.unwrap();
        assert_eq!(session.connect_timeout_ms, Some(5000));
        assert_eq!(session.max_events_per_tick, Some(16));
    }

    #[test]
    fn test_yaml_config_partial() {
        let yaml = r#"
audio:
  watermark_ms: 100
"#;
        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.backend.is_none());
        assert!(config.session.is_none());
        let audio = config.audio.unwrap();
        assert_eq!(audio.watermark_ms, Some(100));
        assert!(audio.capture_sample_rate.is_none());
    }

    #[test]
    fn test_yaml_config_empty() {
        let config: YamlConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.backend.is_none());
        assert!(config.audio.is_none());
        assert!(config.assembler.is_none());
    }

    #[test]
    fn test_backend_debug_redacts_key() {
        let backend = BackendYaml {
            api_key: Some("super-secret".to_string()),
            ..Default::default()
        };
        let debug = format!("{:?}", backend);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        fs::write(
            &config_path,
            r#"
backend:
  model: "models/from-file"
"#,
        )
        .unwrap();

        let config = YamlConfig::from_file(&config_path).unwrap();
        assert_eq!(
            config.backend.as_ref().unwrap().model,
            Some("models/from-file".to_string())
        );
    }

    #[test]
    fn test_from_file_not_found() {
        let path = PathBuf::from("/nonexistent/config.yaml");
        let result = YamlConfig::from_file(&path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");

        fs::write(&config_path, "invalid: yaml: content:").unwrap();

        let result = YamlConfig::from_file(&config_path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }
}
