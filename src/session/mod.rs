//! Duplex session orchestration.
//!
//! [`SessionOrchestrator`] ties the protocol client, packet assembly, release
//! gating and playback together and reports everything the consumer needs as
//! [`SessionEvent`]s from [`SessionOrchestrator::tick`].

pub mod events;
pub mod orchestrator;

pub use events::SessionEvent;
pub use orchestrator::{FunctionCallHandler, HandlerError, OrchestratorConfig, SessionOrchestrator};
