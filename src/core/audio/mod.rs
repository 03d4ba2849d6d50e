//! Audio plumbing between the network and the output device.

pub mod pcm;
pub mod playback;
pub mod ring_buffer;

pub use playback::{
    DEFAULT_OUTPUT_SAMPLE_RATE, DEFAULT_SOURCE_SAMPLE_RATE, PlaybackConfig, PlaybackEngine,
    PlaybackRenderer, PlaybackStats,
};
pub use ring_buffer::SampleRingBuffer;
