//! Duplex protocol client for the live conversation backend.
//!
//! # Audio Format
//!
//! Captured audio is sent as PCM 16-bit signed little-endian mono at the
//! capture rate (16 kHz by default). The backend replies with the same encoding
//! at 24 kHz.

pub mod base;
pub mod client;
pub mod config;
pub mod messages;

pub use base::{ProtocolEvent, RealtimeError, RealtimeResult, SessionState};
pub use client::ProtocolClient;
pub use config::{
    DEFAULT_CAPTURE_SAMPLE_RATE, DEFAULT_LIVE_MODEL, GEMINI_LIVE_URL, LIVE_OUTPUT_SAMPLE_RATE,
    LiveVoice, ProtocolClientConfig, ResponseModality,
};
