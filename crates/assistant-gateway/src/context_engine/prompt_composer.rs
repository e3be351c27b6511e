//! Builds the plain-text model input for a turn

use crate::memory::{Message, Role};
use crate::memory_db::{MemoryDatabase, MemorySettings, UserMemory};
use std::sync::Arc;
use tracing::{debug, warn};

pub const PERSONA: &str = "あなたは役立つAIアシスタントです。以下の会話を元に最新の質問に回答してください。\n\n";

const MEMORY_BLOCK_HEADER: &str = "ユーザーについて記憶している情報:\n";

fn push_turn(prompt: &mut String, role: Role, content: &str) {
    if let Some(label) = role.prompt_label() {
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(content);
        prompt.push('\n');
    }
}

fn push_memories(prompt: &mut String, memories: &[UserMemory]) {
    if memories.is_empty() {
        return;
    }
    prompt.push_str(MEMORY_BLOCK_HEADER);
    for memory in memories {
        prompt.push_str(&format!("- {}: {}\n", memory.key, memory.value));
    }
    prompt.push('\n');
}

/// Render an instruction followed by an exchange, ending on an open assistant turn.
///
/// Used for detector probes and reasoning calls, whose instruction text has
/// to reach the model verbatim rather than being dropped like a system turn.
pub fn render_instruction_prompt(instruction: &str, history: &[Message], user_text: &str) -> String {
    let mut prompt = String::with_capacity(instruction.len() + user_text.len() + 64);
    prompt.push_str(instruction.trim_end());
    prompt.push_str("\n\n");
    for message in history {
        push_turn(&mut prompt, message.role, &message.content);
    }
    push_turn(&mut prompt, Role::User, user_text);
    prompt.push_str("アシスタント: ");
    prompt
}

pub struct PromptComposer {
    database: Arc<MemoryDatabase>,
}

impl PromptComposer {
    pub fn new(database: Arc<MemoryDatabase>) -> Self {
        Self { database }
    }

    /// Compose using the currently stored settings.
    pub fn format(&self, messages: &[Message], session_id: Option<&str>) -> String {
        let settings = self.database.settings.memory_settings().unwrap_or_else(|e| {
            warn!("Failed to read memory settings, using defaults: {}", e);
            MemorySettings::default()
        });
        self.compose(messages, session_id, &settings)
    }

    /// Persona, stored user memories, persisted history, then this turn.
    ///
    /// Store read failures only shrink the prompt; they never fail it.
    pub fn compose(&self, messages: &[Message], session_id: Option<&str>, settings: &MemorySettings) -> String {
        let mut prompt = String::from(PERSONA);

        if settings.user_memory_enabled {
            match self.database.memories.list_all() {
                Ok(memories) => push_memories(&mut prompt, &memories),
                Err(e) => warn!("Failed to load user memories for prompt: {}", e),
            }
        }

        if settings.memory_enabled {
            if let Some(session_id) = session_id {
                match self.database.sessions.get_messages(session_id, Some(settings.max_context_messages)) {
                    Ok(history) => {
                        debug!("Including {} history messages from session {}", history.len(), session_id);
                        for message in &history {
                            push_turn(&mut prompt, message.role, &message.content);
                        }
                    }
                    Err(e) => warn!("Failed to load history for session {}: {}", session_id, e),
                }
            }
        }

        for message in messages {
            push_turn(&mut prompt, message.role, &message.content);
        }

        if messages.last().map(|m| m.role == Role::User).unwrap_or(false) {
            prompt.push_str("アシスタント: ");
        }
        prompt
    }
}
