// =============================================================================
// Market Pulse — real-time windowed metrics and signal detection
// =============================================================================

pub mod binance;
pub mod error;
pub mod market_data;
pub mod orchestrator;
pub mod runtime_config;
pub mod signals;
pub mod stream;
pub mod types;

pub use orchestrator::{EngineEvent, OrchestratorSettings, StreamOrchestrator};
pub use runtime_config::EngineConfig;
