//! Resampling playback engine.
//!
//! Inbound assistant audio arrives at a fixed source rate (24 kHz for the live
//! backend) and has to be played on an output device running at whatever rate
//! the platform chose. The engine is split in two halves:
//!
//! - [`PlaybackEngine`]: the control handle, owned by the session context. It
//!   pushes decoded samples and starts, stops or clears playback.
//! - [`PlaybackRenderer`]: owned by the output device callback. Its
//!   [`render`](PlaybackRenderer::render) method drains the ring and resamples
//!   with linear interpolation.
//!
//! The halves share only the [`SampleRingBuffer`] plus atomic flags and
//! counters. `render` never allocates, locks, logs or blocks.
//!
//! # Buffering
//!
//! After start or a clear, output stays silent until at least `watermark`
//! worth of audio is buffered, or the producer marked end-of-stream with
//! something to play. Once playing, an underrun produces silence for the
//! missing frames without going back to buffering. Draining the ring after
//! end-of-stream does re-arm the watermark for the next turn.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::ring_buffer::SampleRingBuffer;

/// Sample rate of audio produced by the live backend.
pub const DEFAULT_SOURCE_SAMPLE_RATE: u32 = 24_000;

/// Typical device output rate.
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 48_000;

/// Audio buffered before playback starts.
pub const DEFAULT_WATERMARK: Duration = Duration::from_millis(300);

/// Largest callback processed in one pass; bigger callbacks are chunked.
pub const DEFAULT_MAX_FRAMES_PER_CALLBACK: usize = 4096;

/// Seconds of source audio the ring can hold.
pub const DEFAULT_BUFFER_SECONDS: f32 = 30.0;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a [`PlaybackEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackConfig {
    /// Rate of the samples pushed into the engine.
    pub source_sample_rate: u32,
    /// Rate the output device consumes.
    pub output_sample_rate: u32,
    /// Minimum buffered audio before output becomes non-silent.
    pub watermark: Duration,
    /// Ring capacity, in seconds of source audio.
    pub buffer_seconds: f32,
    /// Scratch sizing for the render path.
    pub max_frames_per_callback: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            source_sample_rate: DEFAULT_SOURCE_SAMPLE_RATE,
            output_sample_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
            watermark: DEFAULT_WATERMARK,
            buffer_seconds: DEFAULT_BUFFER_SECONDS,
            max_frames_per_callback: DEFAULT_MAX_FRAMES_PER_CALLBACK,
        }
    }
}

impl PlaybackConfig {
    /// Source samples consumed per output frame.
    #[inline]
    pub fn ratio(&self) -> f64 {
        self.source_sample_rate.max(1) as f64 / self.output_sample_rate.max(1) as f64
    }

    /// Watermark expressed in source samples.
    pub fn watermark_samples(&self) -> usize {
        (self.watermark.as_secs_f64() * self.source_sample_rate as f64).ceil() as usize
    }
}

// =============================================================================
// Shared State
// =============================================================================

/// Counters updated by the render callback.
///
/// Snapshot via [`PlaybackEngine::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackStats {
    pub callbacks: u64,
    pub rendered_frames: u64,
    pub underrun_frames: u64,
    pub dropped_samples: u64,
}

#[derive(Debug)]
struct PlaybackShared {
    ring: SampleRingBuffer,
    running: AtomicBool,
    reset_requested: AtomicBool,
    end_of_stream: AtomicBool,
    callbacks: AtomicU64,
    rendered_frames: AtomicU64,
    underrun_frames: AtomicU64,
}

// =============================================================================
// Control Handle
// =============================================================================

/// Control side of the playback engine.
#[derive(Debug)]
pub struct PlaybackEngine {
    config: PlaybackConfig,
    shared: Arc<PlaybackShared>,
}

impl PlaybackEngine {
    /// Build an engine and the renderer that the output device will own.
    pub fn new(config: PlaybackConfig) -> (Self, PlaybackRenderer) {
        let ring = SampleRingBuffer::with_duration(config.source_sample_rate, config.buffer_seconds);
        let shared = Arc::new(PlaybackShared {
            ring,
            running: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            end_of_stream: AtomicBool::new(false),
            callbacks: AtomicU64::new(0),
            rendered_frames: AtomicU64::new(0),
            underrun_frames: AtomicU64::new(0),
        });

        let max_frames = config.max_frames_per_callback.max(1);
        let ratio = config.ratio();
        let scratch_len = (max_frames as f64 * ratio).ceil() as usize + 2;

        let renderer = PlaybackRenderer {
            shared: Arc::clone(&shared),
            ratio,
            watermark_samples: config.watermark_samples(),
            max_frames,
            scratch: vec![0.0; scratch_len].into_boxed_slice(),
            position: 0.0,
            buffering: true,
        };

        (Self { config, shared }, renderer)
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Begin producing output. Buffering restarts from the watermark.
    pub fn start(&self) {
        self.shared.reset_requested.store(true, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        tracing::debug!(
            source_rate = self.config.source_sample_rate,
            output_rate = self.config.output_sample_rate,
            "Playback started"
        );
    }

    /// Stop output and discard anything buffered.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.clear_buffer();
        tracing::debug!("Playback stopped");
    }

    /// Discard buffered audio and reset buffering state and resample phase.
    pub fn clear_buffer(&self) {
        self.shared.ring.clear();
        self.shared.end_of_stream.store(false, Ordering::Release);
        self.shared.reset_requested.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Queue source-rate samples for playback. Returns how many were accepted.
    pub fn push_samples(&self, samples: &[f32]) -> usize {
        let accepted = self.shared.ring.write(samples);
        if accepted < samples.len() {
            tracing::warn!(
                dropped = samples.len() - accepted,
                "Playback buffer full, dropping samples"
            );
        }
        accepted
    }

    /// Tell the renderer no more audio is coming for now, so a tail shorter
    /// than the watermark still plays.
    pub fn mark_end_of_stream(&self, end: bool) {
        self.shared.end_of_stream.store(end, Ordering::Release);
    }

    pub fn buffered_samples(&self) -> usize {
        self.shared.ring.available()
    }

    pub fn buffered_duration(&self) -> Duration {
        Duration::from_secs_f64(
            self.buffered_samples() as f64 / self.config.source_sample_rate.max(1) as f64,
        )
    }

    /// True once every pushed sample has been rendered.
    pub fn is_drained(&self) -> bool {
        self.shared.ring.is_empty()
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            callbacks: self.shared.callbacks.load(Ordering::Relaxed),
            rendered_frames: self.shared.rendered_frames.load(Ordering::Relaxed),
            underrun_frames: self.shared.underrun_frames.load(Ordering::Relaxed),
            dropped_samples: self.shared.ring.dropped_samples(),
        }
    }
}

// =============================================================================
// Renderer
// =============================================================================

/// Real-time side of the playback engine.
///
/// Move this into the output device callback and call [`render`](Self::render)
/// once per device period.
#[derive(Debug)]
pub struct PlaybackRenderer {
    shared: Arc<PlaybackShared>,
    ratio: f64,
    watermark_samples: usize,
    max_frames: usize,
    scratch: Box<[f32]>,
    /// Fractional read phase into the ring, always in `[0, 1)`.
    position: f64,
    buffering: bool,
}

impl PlaybackRenderer {
    /// Fill `out` with interleaved audio for `channels` channels.
    ///
    /// The whole slice is always written. Any trailing partial frame is zeroed.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let shared = &*self.shared;
        shared.callbacks.fetch_add(1, Ordering::Relaxed);
        let channels = channels.max(1);

        if shared.reset_requested.swap(false, Ordering::AcqRel) {
            self.buffering = true;
            self.position = 0.0;
        }

        if !shared.running.load(Ordering::Acquire) {
            out.fill(0.0);
            return;
        }

        if self.buffering {
            let available = shared.ring.available();
            let end_of_stream = shared.end_of_stream.load(Ordering::Acquire);
            if available >= self.watermark_samples || (end_of_stream && available > 0) {
                self.buffering = false;
            } else {
                out.fill(0.0);
                return;
            }
        }

        let whole = out.len() - out.len() % channels;
        let (frames_out, tail) = out.split_at_mut(whole);
        tail.fill(0.0);

        for chunk in frames_out.chunks_mut(self.max_frames * channels) {
            self.render_chunk(chunk, channels);
        }

        let shared = &*self.shared;
        if shared.end_of_stream.load(Ordering::Acquire) && shared.ring.is_empty() {
            self.buffering = true;
            self.position = 0.0;
        }
    }

    fn render_chunk(&mut self, chunk: &mut [f32], channels: usize) {
        let shared = &*self.shared;
        let frames = chunk.len() / channels;
        let end = self.position + frames as f64 * self.ratio;

        let wanted = (end.floor() as usize + 1).min(self.scratch.len());
        let (cursor, window) = shared.ring.peek_at(&mut self.scratch[..wanted]);

        let mut missing = 0u64;
        for (i, frame) in chunk.chunks_exact_mut(channels).enumerate() {
            let p = self.position + i as f64 * self.ratio;
            let i0 = p.floor() as usize;
            let value = if i0 < window {
                let i1 = (i0 + 1).min(window - 1);
                let frac = (p - i0 as f64) as f32;
                let s0 = self.scratch[i0];
                let s1 = self.scratch[i1];
                s0 + (s1 - s0) * frac
            } else {
                missing += 1;
                0.0
            };
            frame.fill(value);
        }

        let consume = end.floor() as usize;
        // Consume relative to the peeked cursor so a concurrent clear() and
        // refill is never skipped unplayed.
        let consumed = shared.ring.consume_from(cursor, consume);
        if consumed < consume {
            self.position = 0.0;
        } else {
            self.position = end - consume as f64;
        }

        shared
            .rendered_frames
            .fetch_add(frames as u64, Ordering::Relaxed);
        if missing > 0 {
            shared.underrun_frames.fetch_add(missing, Ordering::Relaxed);
        }
    }
}
