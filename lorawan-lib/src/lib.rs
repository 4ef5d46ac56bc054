pub mod constants;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod mac;
pub mod processor;
pub mod semtech;
pub mod session;
pub mod telemetry;
pub mod types;


// Re-export the orchestrator for easy access
pub use processor::{MessageProcessor, ProcessorConfig};
