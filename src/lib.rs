pub mod config;
pub mod core;
pub mod session;

// Re-export commonly used items for convenience
pub use config::{ConfigError, DuplexConfig};
pub use core::*;
pub use session::{
    FunctionCallHandler, HandlerError, OrchestratorConfig, SessionEvent, SessionOrchestrator,
};
