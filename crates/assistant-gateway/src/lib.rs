// assistant-gateway/src/lib.rs

pub mod capabilities;
pub mod config;
pub mod context_engine;
pub mod error;
pub mod intent;
pub mod memory;
pub mod memory_db;
pub mod reasoning;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use config::{Config, GeneratorBackend};
pub use context_engine::{StreamEvent, TurnOrchestrator, TurnOutput, TurnRequest, TurnResponse, Usage};
pub use error::{GatewayError, GatewayResult};
pub use memory::{Message, Role};
pub use memory_db::MemoryDatabase;
pub use reasoning::{DetailLevel, ReasoningEngine, ReasoningOutcome, ReasoningTask};
