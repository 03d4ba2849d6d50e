pub mod audio;
pub mod packets;
pub mod realtime;

pub use audio::{PlaybackConfig, PlaybackEngine, PlaybackRenderer, SampleRingBuffer};
pub use packets::{
    AssemblerConfig, FixedDelayGate, FunctionCallInfo, PacketAssembler, PacketKind,
    PacketRelease, ReleaseGate, SyncPacket,
};
pub use realtime::{
    ProtocolClient, ProtocolClientConfig, ProtocolEvent, RealtimeError, RealtimeResult,
    SessionState,
};
