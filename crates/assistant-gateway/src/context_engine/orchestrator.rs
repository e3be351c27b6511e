//! The per-turn pipeline: detect, dispatch, or fall back to generation.
//!
//! Detectors run in a fixed order (memory, file, web search, code host) and
//! the first match claims the turn. Only validation errors escape
//! [`TurnOrchestrator::process_turn`]; detector, capability, generator and
//! persistence failures are logged and turned into ordinary response text.

use crate::capabilities::{
    CodeHostClient, FileStore, GenerationParams, Generator, SamplingParams, TextStream, WebSearch,
};
use crate::context_engine::prompt_composer::{render_instruction_prompt, PromptComposer};
use crate::context_engine::responses;
use crate::error::{GatewayError, GatewayResult};
use crate::intent::{
    split_key_value, CodeHostIntentDetector, FileIntentDetector, IntentDetector, MemoryIntent,
    MemoryIntentDetector, WebSearchIntent, WebSearchIntentDetector,
};
use crate::memory::{Message, Role};
use crate::memory_db::{MemoryDatabase, MemorySettings};
use crate::utils::TextUtils;
use chrono::Local;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_SEARCH_RESULT_COUNT: u32 = 5;

/// One caller-submitted turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub messages: Vec<Message>,
    pub session_id: Option<String>,
    pub params: GenerationParams,
    pub stream: bool,
}

impl TurnRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages, ..Default::default() }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Word-count estimates plus wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    pub time_seconds: f64,
}

impl Usage {
    fn estimate(prompt: &str, completion: &str, started: Instant) -> Self {
        let prompt_tokens = TextUtils::count_words(prompt);
        let completion_tokens = TextUtils::count_words(completion);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            time_seconds: started.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub role: Role,
    pub content: String,
    pub session_id: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Error(String),
    /// End-of-stream sentinel, always the last event.
    Done,
}

pub type TurnStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

pub enum TurnOutput {
    Complete(TurnResponse),
    Stream { session_id: String, events: TurnStream },
}

impl std::fmt::Debug for TurnOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnOutput::Complete(response) => f.debug_tuple("Complete").field(response).finish(),
            TurnOutput::Stream { session_id, .. } => {
                f.debug_struct("Stream").field("session_id", session_id).finish_non_exhaustive()
            }
        }
    }
}

impl TurnOutput {
    pub fn session_id(&self) -> &str {
        match self {
            TurnOutput::Complete(response) => &response.session_id,
            TurnOutput::Stream { session_id, .. } => session_id,
        }
    }

    pub fn into_complete(self) -> Option<TurnResponse> {
        match self {
            TurnOutput::Complete(response) => Some(response),
            TurnOutput::Stream { .. } => None,
        }
    }
}

fn single_chunk(content: String) -> TurnStream {
    Box::pin(futures::stream::iter([StreamEvent::Delta(content), StreamEvent::Done]))
}

/// Forward generator chunks. Dropping the returned stream drops the upstream.
fn relay(mut upstream: TextStream) -> TurnStream {
    Box::pin(async_stream::stream! {
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) if chunk.is_empty() => {}
                Ok(chunk) => yield StreamEvent::Delta(chunk),
                Err(e) => {
                    warn!("Generator stream failed: {}", e);
                    yield StreamEvent::Error(responses::generation_failure(&e));
                    break;
                }
            }
        }
        yield StreamEvent::Done;
    })
}

async fn detect_or_miss<D: IntentDetector>(detector: &D, utterance: &str, name: &str) -> Option<D::Intent> {
    match detector.detect(utterance).await {
        Ok(detection) => detection.into_option(),
        Err(e) => {
            warn!("{} detection failed, treating as no match: {}", name, e);
            None
        }
    }
}

pub struct TurnOrchestrator {
    database: Arc<MemoryDatabase>,
    generator: Arc<dyn Generator>,
    composer: PromptComposer,
    memory_detector: MemoryIntentDetector,
    file_detector: FileIntentDetector,
    web_detector: WebSearchIntentDetector,
    code_host_detector: CodeHostIntentDetector,
    file_store: Arc<dyn FileStore>,
    web_search: Arc<dyn WebSearch>,
    code_host: Arc<dyn CodeHostClient>,
    defaults: SamplingParams,
    search_result_count: u32,
}

impl TurnOrchestrator {
    pub fn new(
        database: Arc<MemoryDatabase>,
        generator: Arc<dyn Generator>,
        file_store: Arc<dyn FileStore>,
        web_search: Arc<dyn WebSearch>,
        code_host: Arc<dyn CodeHostClient>,
    ) -> Self {
        info!("Turn orchestrator initialized");
        Self {
            composer: PromptComposer::new(Arc::clone(&database)),
            memory_detector: MemoryIntentDetector::new(),
            file_detector: FileIntentDetector::new(Arc::clone(&generator)),
            web_detector: WebSearchIntentDetector::new(Arc::clone(&generator)),
            code_host_detector: CodeHostIntentDetector::new(Arc::clone(&generator)),
            database,
            generator,
            file_store,
            web_search,
            code_host,
            defaults: SamplingParams::default(),
            search_result_count: DEFAULT_SEARCH_RESULT_COUNT,
        }
    }

    /// Sampling used when a turn leaves a parameter unset.
    pub fn with_defaults(mut self, defaults: SamplingParams) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_search_result_count(mut self, count: u32) -> Self {
        self.search_result_count = count.max(1);
        self
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }

    pub async fn process_turn(&self, request: TurnRequest) -> GatewayResult<TurnOutput> {
        let started = Instant::now();
        let utterance = validate(&request.messages)?.to_string();

        let settings = self.database.settings.memory_settings().unwrap_or_else(|e| {
            warn!("Failed to read memory settings, using defaults: {}", e);
            MemorySettings::default()
        });
        let session_id = request
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if settings.memory_enabled {
            self.resolve_session(&session_id);
        }
        let params = request.params.resolve(&self.defaults);

        if let Some(content) = self.route(&utterance, &session_id, &params).await {
            if settings.memory_enabled {
                self.persist(&session_id, Role::User, &utterance);
                self.persist(&session_id, Role::Assistant, &content);
            }
            return Ok(if request.stream {
                TurnOutput::Stream { session_id, events: single_chunk(content) }
            } else {
                let usage = Usage::estimate(&utterance, &content, started);
                TurnOutput::Complete(TurnResponse { role: Role::Assistant, content, session_id, usage })
            });
        }

        // Compose before persisting this turn so history does not repeat it.
        let history_session = settings.memory_enabled.then_some(session_id.as_str());
        let prompt = self.composer.compose(&request.messages, history_session, &settings);
        if settings.memory_enabled {
            self.persist(&session_id, Role::User, &utterance);
        }

        if request.stream {
            let events = match self.generator.generate_stream(&prompt, &params).await {
                Ok(upstream) => relay(upstream),
                Err(e) => {
                    error!("Generator failed to start streaming: {}", e);
                    Box::pin(futures::stream::iter([
                        StreamEvent::Error(responses::generation_failure(&e)),
                        StreamEvent::Done,
                    ])) as TurnStream
                }
            };
            return Ok(TurnOutput::Stream { session_id, events });
        }

        let content = match self.generator.generate(&prompt, &params).await {
            Ok(text) => {
                if settings.memory_enabled && !text.trim().is_empty() {
                    self.persist(&session_id, Role::Assistant, &text);
                }
                text
            }
            Err(e) => {
                error!("Generation failed for session {}: {}", session_id, e);
                responses::generation_failure(&e)
            }
        };
        let usage = Usage::estimate(&prompt, &content, started);
        Ok(TurnOutput::Complete(TurnResponse { role: Role::Assistant, content, session_id, usage }))
    }

    /// Create-if-absent. A concurrent creator winning the race is not an error.
    fn resolve_session(&self, session_id: &str) {
        match self.database.sessions.ensure_session(session_id) {
            Ok(true) => info!("Created session {}", session_id),
            Ok(false) => {}
            Err(e) if GatewayError::is_session_exists(&e) => debug!("Session {} created concurrently", session_id),
            Err(e) => error!("Failed to resolve session {}: {}", session_id, e),
        }
    }

    fn persist(&self, session_id: &str, role: Role, content: &str) {
        if let Err(e) = self.database.sessions.append_message(session_id, role, content, None) {
            error!("Failed to persist {} message for session {}: {}", role, session_id, e);
        }
    }

    /// Capability answer for the first detector that claims the utterance.
    async fn route(&self, utterance: &str, session_id: &str, params: &SamplingParams) -> Option<String> {
        if let Some(intent) = self.memory_detector.classify(utterance).into_option() {
            info!("Dispatching memory operation: {}", intent.tag());
            return Some(self.handle_memory(intent, session_id));
        }

        if let Some(operation) = detect_or_miss(&self.file_detector, utterance, "File").await {
            info!("Dispatching file operation: {}", operation.tag());
            return Some(match self.file_store.execute(&operation).await {
                Ok(outcome) => responses::render_file_outcome(&outcome),
                Err(e) => {
                    error!("File operation {} failed: {}", operation.tag(), e);
                    responses::capability_failure("ファイル操作", &e)
                }
            });
        }

        if let Some(intent) = detect_or_miss(&self.web_detector, utterance, "Web search").await {
            return Some(self.handle_web_search(intent, utterance, params).await);
        }

        if let Some(operation) = detect_or_miss(&self.code_host_detector, utterance, "Code host").await {
            info!("Dispatching code-host operation: {}", operation.tag());
            return Some(match self.code_host.execute(&operation).await {
                Ok(outcome) => responses::render_code_host_outcome(&operation, &outcome),
                Err(e) => {
                    error!("Code-host operation {} failed: {}", operation.tag(), e);
                    responses::capability_failure("GitHub操作", &e)
                }
            });
        }

        None
    }

    fn handle_memory(&self, intent: MemoryIntent, session_id: &str) -> String {
        self.execute_memory(&intent, session_id).unwrap_or_else(|e| {
            error!("Memory operation {} failed: {}", intent.tag(), e);
            responses::capability_failure("記憶操作", &e)
        })
    }

    fn execute_memory(&self, intent: &MemoryIntent, session_id: &str) -> anyhow::Result<String> {
        let memories = &self.database.memories;
        Ok(match intent {
            MemoryIntent::Store { content } => {
                let (key, value) = split_key_value(content);
                memories.store(&key, &value, Some(session_id))?;
                responses::memory_stored(&key, &value)
            }
            MemoryIntent::Retrieve { key } => match memories.get(key)? {
                Some(memory) => responses::memory_recalled(&memory.key, &memory.value),
                None => responses::memory_not_found(key),
            },
            MemoryIntent::Forget { key } => {
                if memories.delete(key)? {
                    responses::memory_forgotten(key)
                } else {
                    responses::memory_forget_missing(key)
                }
            }
            MemoryIntent::ListAll => responses::memory_list(&memories.list_all()?),
            MemoryIntent::ForgetAll => responses::memory_cleared(memories.delete_all()?),
            MemoryIntent::Help => responses::MEMORY_HELP.to_string(),
        })
    }

    async fn handle_web_search(&self, intent: WebSearchIntent, utterance: &str, params: &SamplingParams) -> String {
        let query = match intent {
            WebSearchIntent::CurrentDate => {
                info!("Answering date question from the local clock");
                return responses::current_date_answer(&Local::now());
            }
            WebSearchIntent::Query(query) => query,
        };
        info!("Dispatching web search: '{}'", query);

        let outcome = match self.web_search.search(&query, self.search_result_count).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Web search for '{}' failed: {}", query, e);
                return responses::capability_failure("Web検索", &e);
            }
        };
        let formatted = responses::format_search_results(&outcome);
        if !outcome.success || outcome.results.is_empty() {
            return formatted;
        }

        let instruction = responses::search_answer_instruction(utterance, &formatted);
        let prompt = render_instruction_prompt(&instruction, &[], utterance);
        match self.generator.generate(&prompt, params).await {
            Ok(answer) if !answer.trim().is_empty() => answer,
            Ok(_) => formatted,
            Err(e) => {
                warn!("Search answer generation failed, returning raw results: {}", e);
                formatted
            }
        }
    }
}

/// The trimmed latest user utterance, or a validation error.
fn validate(messages: &[Message]) -> GatewayResult<&str> {
    let last = messages
        .last()
        .ok_or_else(|| GatewayError::validation("a turn needs at least one message"))?;
    if last.role != Role::User {
        return Err(GatewayError::validation(format!(
            "the last message must come from the user, got {}",
            last.role
        )));
    }
    let text = last.content.trim();
    if text.is_empty() {
        return Err(GatewayError::validation("the user message is empty"));
    }
    Ok(text)
}
