//! Turn-synchronized packets: assembly, release gating and ordering.

pub mod assembler;
pub mod gate;
pub mod types;

pub use assembler::{AssemblerConfig, PacketAssembler};
pub use gate::{FixedDelayGate, PacketRelease, ReleaseError, ReleaseGate, ReleaseOrder};
pub use types::{FunctionCallInfo, PacketKind, SyncPacket};
