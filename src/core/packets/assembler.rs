//! Sentence-boundary packet assembler.
//!
//! Streaming transcript deltas and audio chunks for one assistant turn are
//! buffered here and cut into [`SyncPacket`]s at sentence boundaries, so that
//! subtitles and animation can consume whole sentences together with the audio
//! that was received alongside them.
//!
//! A boundary is a `.`, `?` or `!` followed by whitespace. Text without a
//! boundary is held until either the turn finishes or the fallback flush fires
//! (enough unflushed characters and enough time since the last flush), in which
//! case it is cut at the last whitespace.

use std::time::{Duration, Instant};

use serde_json::Value;

use super::types::{FunctionCallInfo, PacketKind, SyncPacket};

/// Time without a flush before the fallback may cut a fragment.
pub const DEFAULT_FALLBACK_FLUSH: Duration = Duration::from_millis(500);

/// Unflushed characters required before the fallback may cut a fragment.
pub const DEFAULT_FALLBACK_MIN_CHARS: usize = 20;

/// Tuning for [`PacketAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerConfig {
    pub fallback_flush: Duration,
    pub fallback_min_chars: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            fallback_flush: DEFAULT_FALLBACK_FLUSH,
            fallback_min_chars: DEFAULT_FALLBACK_MIN_CHARS,
        }
    }
}

/// Per-session packet assembler. Owned by the session context; not thread-safe.
#[derive(Debug)]
pub struct PacketAssembler {
    config: AssemblerConfig,
    turn_id: u64,
    sequence: u32,
    active: bool,
    /// Text received since the last flush.
    pending_text: String,
    pending_audio: Vec<Vec<f32>>,
    last_flush: Instant,
}

impl Default for PacketAssembler {
    fn default() -> Self {
        Self::new(AssemblerConfig::default())
    }
}

impl PacketAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self {
            config,
            turn_id: 0,
            sequence: 0,
            active: false,
            pending_text: String::new(),
            pending_audio: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    /// Id of the current (or most recent) turn. 0 before the first turn.
    #[inline]
    pub fn current_turn_id(&self) -> u64 {
        self.turn_id
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Sequence number the next packet of this turn will carry.
    #[inline]
    pub fn next_sequence(&self) -> u32 {
        self.sequence
    }

    pub fn pending_text(&self) -> &str {
        &self.pending_text
    }

    /// Begin a new turn and return its id. Any unfinished turn is discarded.
    pub fn start_turn(&mut self) -> u64 {
        self.start_turn_at(Instant::now())
    }

    pub fn start_turn_at(&mut self, now: Instant) -> u64 {
        if self.active {
            tracing::debug!(
                turn_id = self.turn_id,
                "Starting a new turn before the previous one finished, discarding it"
            );
        }
        self.turn_id += 1;
        self.sequence = 0;
        self.active = true;
        self.pending_text.clear();
        self.pending_audio.clear();
        self.last_flush = now;
        tracing::debug!(turn_id = self.turn_id, "Turn started");
        self.turn_id
    }

    /// Append a transcript delta. Returns a packet when a boundary or the
    /// fallback flush completes one.
    pub fn push_text(&mut self, text: &str) -> Option<SyncPacket> {
        self.push_text_at(text, Instant::now())
    }

    pub fn push_text_at(&mut self, text: &str, now: Instant) -> Option<SyncPacket> {
        if !self.active {
            tracing::debug!("Ignoring text while no turn is active");
            return None;
        }
        self.pending_text.push_str(text);

        if let Some(end) = last_sentence_boundary(&self.pending_text) {
            return Some(self.flush_text_to(end, now));
        }
        self.poll_fallback(now)
    }

    /// Queue an audio chunk; it is attached to the next emitted packet.
    pub fn push_audio(&mut self, samples: Vec<f32>) {
        if !self.active {
            tracing::debug!("Ignoring audio while no turn is active");
            return;
        }
        if !samples.is_empty() {
            self.pending_audio.push(samples);
        }
    }

    /// Emit a function call packet immediately, bypassing text buffering.
    pub fn push_function_call(
        &mut self,
        name: impl Into<String>,
        args: Value,
        call_id: impl Into<String>,
    ) -> Option<SyncPacket> {
        if !self.active {
            tracing::debug!("Ignoring function call while no turn is active");
            return None;
        }
        let packet = SyncPacket {
            kind: PacketKind::FunctionCall,
            turn_id: self.turn_id,
            sequence: self.take_sequence(),
            text: String::new(),
            audio: None,
            function_call: Some(FunctionCallInfo {
                name: name.into(),
                args,
                call_id: call_id.into(),
            }),
            is_turn_end: false,
        };
        tracing::debug!(
            turn_id = packet.turn_id,
            sequence = packet.sequence,
            "Function call packet emitted"
        );
        Some(packet)
    }

    /// Cut a fragment at the last whitespace if the fallback thresholds are met.
    pub fn poll_fallback(&mut self, now: Instant) -> Option<SyncPacket> {
        if !self.active
            || now.saturating_duration_since(self.last_flush) < self.config.fallback_flush
            || self.pending_text.chars().count() < self.config.fallback_min_chars
        {
            return None;
        }

        let (idx, ws) = self
            .pending_text
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())?;
        if self.pending_text[..idx].trim().is_empty() {
            return None;
        }

        tracing::trace!(turn_id = self.turn_id, "Fallback flush");
        Some(self.flush_text_to(idx + ws.len_utf8(), now))
    }

    /// Flush everything that remains as the final packet of the turn.
    ///
    /// Returns `None` when no turn is active, so a second call emits nothing.
    pub fn finish_turn(&mut self) -> Option<SyncPacket> {
        if !self.active {
            return None;
        }
        let text = std::mem::take(&mut self.pending_text);
        let mut packet = self.build_text_packet(text.trim().to_string());
        packet.is_turn_end = true;
        self.active = false;
        tracing::debug!(
            turn_id = packet.turn_id,
            sequence = packet.sequence,
            "Turn finished"
        );
        Some(packet)
    }

    /// Drop everything buffered for the current turn without emitting.
    ///
    /// Returns the id of the turn that was cancelled, if one was active.
    pub fn cancel_turn(&mut self) -> Option<u64> {
        self.pending_text.clear();
        self.pending_audio.clear();
        if !self.active {
            return None;
        }
        self.active = false;
        tracing::debug!(turn_id = self.turn_id, "Turn cancelled");
        Some(self.turn_id)
    }

    /// Return to the pristine state, including the turn counter.
    pub fn reset(&mut self) {
        self.turn_id = 0;
        self.sequence = 0;
        self.active = false;
        self.pending_text.clear();
        self.pending_audio.clear();
        self.last_flush = Instant::now();
    }

    fn flush_text_to(&mut self, end: usize, now: Instant) -> SyncPacket {
        let text = self.pending_text[..end].trim().to_string();
        self.pending_text.drain(..end);
        self.last_flush = now;
        let packet = self.build_text_packet(text);
        tracing::debug!(
            turn_id = packet.turn_id,
            sequence = packet.sequence,
            text = %packet.text,
            "Packet emitted"
        );
        packet
    }

    fn build_text_packet(&mut self, text: String) -> SyncPacket {
        let audio = if self.pending_audio.is_empty() {
            None
        } else {
            Some(self.pending_audio.drain(..).flatten().collect())
        };
        SyncPacket {
            kind: PacketKind::TextAudio,
            turn_id: self.turn_id,
            sequence: self.take_sequence(),
            text,
            audio,
            function_call: None,
            is_turn_end: false,
        }
    }

    fn take_sequence(&mut self) -> u32 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }
}

/// Byte offset just past the last `.`, `?` or `!` that is followed by whitespace.
fn last_sentence_boundary(text: &str) -> Option<usize> {
    let mut boundary = None;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '?' | '!')
            && chars.peek().is_some_and(|(_, next)| next.is_whitespace())
        {
            boundary = Some(idx + c.len_utf8());
        }
    }
    boundary
}
