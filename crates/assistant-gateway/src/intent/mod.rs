//! Intent detectors, one per capability family.
//!
//! A detector looks at the latest user utterance and either claims the turn
//! with a typed intent or returns [`Detection::NoMatch`]. Pattern fast paths
//! run first; model probes are the fallback and their failures are the only
//! errors a detector reports.

pub mod memory;
pub mod file_ops;
pub mod web_search;
pub mod code_host;
pub mod reasoning;

pub use memory::{split_key_value, MemoryIntent, MemoryIntentDetector};
pub use file_ops::FileIntentDetector;
pub use web_search::{WebSearchIntent, WebSearchIntentDetector};
pub use code_host::CodeHostIntentDetector;
pub use reasoning::ReasoningIntentDetector;

use crate::capabilities::{Generator, SamplingParams, WireParams};
use crate::context_engine::prompt_composer::render_instruction_prompt;
use crate::utils::{extract_object, extract_object_with_repair};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection<T> {
    NoMatch,
    Match(T),
}

impl<T> Detection<T> {
    pub fn is_match(&self) -> bool {
        matches!(self, Detection::Match(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Detection::Match(intent) => Some(intent),
            Detection::NoMatch => None,
        }
    }
}

impl<T> From<Option<T>> for Detection<T> {
    fn from(value: Option<T>) -> Self {
        value.map(Detection::Match).unwrap_or(Detection::NoMatch)
    }
}

#[async_trait]
pub trait IntentDetector: Send + Sync {
    type Intent: Send;

    async fn detect(&self, utterance: &str) -> anyhow::Result<Detection<Self::Intent>>;
}

/// Sampling used for detector probes: short and near-deterministic.
pub(crate) const PROBE_PARAMS: SamplingParams = SamplingParams {
    max_tokens: 512,
    temperature: 0.1,
    top_p: 0.9,
    top_k: 40,
};

/// Ask the generator to classify `utterance` and pull the JSON object out of
/// its answer. `Ok(None)` means the answer held no usable object; `Err` is a
/// generator failure.
pub(crate) async fn probe(
    generator: &dyn Generator,
    instruction: &str,
    utterance: &str,
    repair: bool,
) -> anyhow::Result<Option<WireParams>> {
    let prompt = render_instruction_prompt(instruction, &[], utterance);
    let raw = generator.generate(&prompt, &PROBE_PARAMS).await?;
    let extracted = if repair { extract_object_with_repair(&raw) } else { extract_object(&raw) };
    match extracted {
        Ok(object) => Ok(Some(object)),
        Err(e) => {
            debug!("Probe answer unusable: {}", e);
            Ok(None)
        }
    }
}

/// Read a model decision of the form `{<flag>: bool, <tag>: str, parameters: {..}}`.
/// Several spellings of the flag and tag keys are accepted.
pub(crate) fn decision(object: &WireParams, flag_keys: &[&str], tag_keys: &[&str]) -> Option<(String, WireParams)> {
    let matched = flag_keys.iter().find_map(|key| object.get(*key)).map(|v| match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    })?;
    if !matched {
        return None;
    }
    let tag = tag_keys
        .iter()
        .find_map(|key| object.get(*key).and_then(|v| v.as_str()))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let params = object
        .get("parameters")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    Some((tag, params))
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::capabilities::{Generator, SamplingParams, TextStream};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Generator returning one scripted reply, recording every prompt.
    pub struct ScriptedGenerator {
        reply: Result<String, String>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        pub fn replying(reply: &str) -> Self {
            Self { reply: Ok(reply.to_string()), prompts: Mutex::new(Vec::new()) }
        }

        pub fn failing(message: &str) -> Self {
            Self { reply: Err(message.to_string()), prompts: Mutex::new(Vec::new()) }
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, prompt: &str, _params: &SamplingParams) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone().map_err(|e| anyhow::anyhow!(e))
        }

        async fn generate_stream(&self, _prompt: &str, _params: &SamplingParams) -> anyhow::Result<TextStream> {
            Err(anyhow::anyhow!("streaming not scripted"))
        }
    }
}
