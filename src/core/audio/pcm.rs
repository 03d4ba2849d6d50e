//! PCM16 little-endian helpers for the wire format.
//!
//! The backend exchanges mono signed 16-bit little-endian PCM, base64-encoded
//! inside JSON, tagged with a MIME type of the form `audio/pcm;rate=N`.

use base64::prelude::*;
use bytes::{BufMut, Bytes, BytesMut};

use crate::core::realtime::base::{RealtimeError, RealtimeResult};

/// Scale factor from i16 to normalized f32.
const PCM_TO_FLOAT_SCALE: f32 = 1.0 / 32768.0;

/// Scale factor from normalized f32 to i16.
const FLOAT_TO_PCM_SCALE: f32 = 32767.0;

/// Encode normalized samples as PCM16LE, clamping to `[-1.0, 1.0]`.
pub fn f32_to_pcm16le(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = if sample.is_nan() {
            0.0
        } else {
            sample.clamp(-1.0, 1.0)
        };
        buf.put_i16_le((clamped * FLOAT_TO_PCM_SCALE).round() as i16);
    }
    buf.freeze()
}

/// Decode PCM16LE bytes into normalized samples. A trailing odd byte is ignored.
pub fn pcm16le_to_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 * PCM_TO_FLOAT_SCALE)
        .collect()
}

/// Encode samples as base64 PCM16LE, the payload of an outbound media chunk.
pub fn encode_base64_pcm(samples: &[f32]) -> String {
    BASE64_STANDARD.encode(f32_to_pcm16le(samples))
}

/// Decode a base64 PCM16LE payload from an inbound media chunk.
pub fn decode_base64_pcm(data: &str) -> RealtimeResult<Vec<f32>> {
    let bytes = BASE64_STANDARD
        .decode(data)
        .map_err(|e| RealtimeError::ProtocolError(format!("Invalid audio payload: {}", e)))?;
    Ok(pcm16le_to_f32(&bytes))
}

/// MIME type announced for outbound audio.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the sample rate from a MIME type such as `audio/pcm;rate=24000`.
///
/// Returns `None` for non-PCM types or a missing/invalid rate parameter.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    let mut parts = mime_type.split(';').map(str::trim);
    let essence = parts.next()?;
    if !essence.eq_ignore_ascii_case("audio/pcm") {
        return None;
    }
    parts.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("rate") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Whether a MIME type describes PCM audio at all.
pub fn is_pcm_mime(mime_type: &str) -> bool {
    mime_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("audio/pcm"))
}
