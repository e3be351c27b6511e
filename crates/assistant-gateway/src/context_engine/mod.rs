//! Context engine module - turn orchestration, prompt composition and response rendering

pub mod prompt_composer;
pub mod responses;
pub mod orchestrator;

pub use prompt_composer::{render_instruction_prompt, PromptComposer, PERSONA};
pub use orchestrator::{
    StreamEvent, TurnOrchestrator, TurnOutput, TurnRequest, TurnResponse, TurnStream, Usage,
};
