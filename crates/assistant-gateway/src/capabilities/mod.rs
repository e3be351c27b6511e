//! Capability executors consumed by the turn pipeline.
//!
//! Each family is a trait so the orchestrator can be wired with the real
//! HTTP/filesystem clients or with in-process fakes. Operations are typed
//! enums; the untyped `{tag, parameters}` shape produced by the detectors'
//! model calls is converted once, in each enum's `from_wire`.

pub mod generator;
pub mod file_store;
pub mod web_search;
pub mod code_host;

pub use generator::{
    GenerationParams, Generator, LlamaServerGenerator, OllamaGenerator, SamplingParams, TextStream,
};
pub use file_store::{FileEntry, FileOperation, FileOutcome, FilePayload, FileStore, LocalFileStore};
pub use web_search::{BraveSearchClient, SearchHit, SearchOutcome, WebSearch};
pub use code_host::{CodeHostClient, CodeHostOperation, CodeHostOutcome, GitHubClient};

use serde_json::{Map, Value};

pub type WireParams = Map<String, Value>;

/// Non-empty string parameter. Numbers are accepted and stringified.
pub(crate) fn str_param(params: &WireParams, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn bool_param(params: &WireParams, key: &str) -> Option<bool> {
    match params.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn u32_param(params: &WireParams, key: &str) -> Option<u32> {
    match params.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
