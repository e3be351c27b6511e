//! Text generation backends.
//!
//! The pipeline only sees [`Generator`]. Two HTTP backends implement it:
//! Ollama's `/api/generate` (NDJSON streaming) and an OpenAI-compatible
//! llama-server `/v1/completions` endpoint (SSE streaming).
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

pub type TextStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// Per-turn sampling overrides, each independently optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
}

/// Fully resolved sampling parameters handed to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { max_tokens: 2048, temperature: 0.7, top_p: 0.9, top_k: 50 }
    }
}

impl GenerationParams {
    pub fn resolve(&self, defaults: &SamplingParams) -> SamplingParams {
        SamplingParams {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            top_k: self.top_k.unwrap_or(defaults.top_k),
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, params: &SamplingParams) -> anyhow::Result<String>;

    /// Incremental generation. Dropping the stream stops pulling from the backend.
    async fn generate_stream(&self, prompt: &str, params: &SamplingParams) -> anyhow::Result<TextStream>;
}

pub(super) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

pub(super) async fn check_status(response: reqwest::Response, backend: &str) -> anyhow::Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(anyhow::anyhow!("{} backend returned {}: {}", backend, status, body))
}

/// Split a byte stream into trimmed, non-empty lines.
///
/// Bytes are buffered until a newline arrives, so a multibyte character cut
/// across two network chunks is decoded whole.
fn lines<S, B, E>(byte_stream: S) -> impl Stream<Item = anyhow::Result<String>> + Send
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    async_stream::try_stream! {
        let mut buffer: Vec<u8> = Vec::new();
        futures_util::pin_mut!(byte_stream);
        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result
                .map_err(|e| anyhow::anyhow!("Stream read error: {}", e))?;
            buffer.extend_from_slice(chunk.as_ref());
            while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=newline_pos).collect();
                let line = decode_line(raw)?;
                if !line.is_empty() {
                    yield line;
                }
            }
        }
        let rest = decode_line(buffer)?;
        if !rest.is_empty() {
            yield rest;
        }
    }
}

fn decode_line(raw: Vec<u8>) -> anyhow::Result<String> {
    let line = String::from_utf8(raw)
        .map_err(|e| anyhow::anyhow!("Stream line is not valid UTF-8: {}", e))?;
    Ok(line.trim().to_string())
}

// ===== Ollama =====

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

pub struct OllamaGenerator {
    base_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let model = model.into();
        info!("Ollama generator initialized: {} ({})", base_url, model);
        Self { base_url, model, http_client: http_client(timeout) }
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    async fn send(&self, prompt: &str, params: &SamplingParams, stream: bool) -> anyhow::Result<reqwest::Response> {
        let request = OllamaRequest {
            model: &self.model,
            prompt,
            stream,
            options: OllamaOptions {
                num_predict: params.max_tokens,
                temperature: params.temperature,
                top_p: params.top_p,
                top_k: params.top_k,
            },
        };
        let response = self.http_client
            .post(self.generate_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Ollama request failed: {}", e))?;
        check_status(response, "Ollama").await
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &str, params: &SamplingParams) -> anyhow::Result<String> {
        debug!("Ollama generating ({} prompt chars)", prompt.chars().count());
        let response = self.send(prompt, params, false).await?;
        let chunk: OllamaChunk = response.json().await
            .map_err(|e| anyhow::anyhow!("Failed to parse Ollama response: {}", e))?;
        if let Some(error) = chunk.error {
            return Err(anyhow::anyhow!("Ollama error: {}", error));
        }
        Ok(chunk.response)
    }

    async fn generate_stream(&self, prompt: &str, params: &SamplingParams) -> anyhow::Result<TextStream> {
        debug!("Ollama starting streaming generation");
        let response = self.send(prompt, params, true).await?;
        let line_stream = lines(response.bytes_stream());
        let stream = async_stream::try_stream! {
            futures_util::pin_mut!(line_stream);
            while let Some(line) = line_stream.next().await {
                let line = line?;
                let chunk: OllamaChunk = serde_json::from_str(&line)
                    .map_err(|e| anyhow::anyhow!("Malformed Ollama chunk: {}", e))?;
                if let Some(error) = chunk.error {
                    Err::<(), _>(anyhow::anyhow!("Ollama error: {}", error))?;
                }
                if !chunk.response.is_empty() {
                    yield chunk.response;
                }
                if chunk.done {
                    break;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

// ===== llama-server (OpenAI-compatible completions) =====

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
    finish_reason: Option<String>,
}

pub struct LlamaServerGenerator {
    backend_url: String,
    http_client: reqwest::Client,
}

impl LlamaServerGenerator {
    pub fn new(backend_url: impl Into<String>, timeout: Duration) -> Self {
        let backend_url = backend_url.into().trim_end_matches('/').to_string();
        info!("llama-server generator initialized with backend: {}", backend_url);
        Self { backend_url, http_client: http_client(timeout) }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/completions", self.backend_url)
    }

    async fn send(&self, prompt: &str, params: &SamplingParams, stream: bool) -> anyhow::Result<reqwest::Response> {
        let request = CompletionRequest {
            model: "local-llm",
            prompt,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            stream,
        };
        let response = self.http_client
            .post(self.completions_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM backend request failed: {}", e))?;
        check_status(response, "LLM").await
    }
}

#[async_trait]
impl Generator for LlamaServerGenerator {
    async fn generate(&self, prompt: &str, params: &SamplingParams) -> anyhow::Result<String> {
        debug!("llama-server generating (non-streaming)");
        let response = self.send(prompt, params, false).await?;
        let completion: CompletionResponse = response.json().await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))?;
        Ok(completion.choices.into_iter().next().map(|c| c.text).unwrap_or_default())
    }

    async fn generate_stream(&self, prompt: &str, params: &SamplingParams) -> anyhow::Result<TextStream> {
        debug!("llama-server starting streaming response");
        let response = self.send(prompt, params, true).await?;
        let line_stream = lines(response.bytes_stream());
        let stream = async_stream::try_stream! {
            futures_util::pin_mut!(line_stream);
            while let Some(line) = line_stream.next().await {
                let line = line?;
                let Some(data) = line.strip_prefix("data:") else { continue };
                let data = data.trim();
                if data == "[DONE]" {
                    break;
                }
                let chunk: CompletionResponse = serde_json::from_str(data)
                    .map_err(|e| anyhow::anyhow!("Malformed SSE chunk: {}", e))?;
                let mut finished = false;
                for choice in chunk.choices {
                    finished |= choice.finish_reason.is_some();
                    if !choice.text.is_empty() {
                        yield choice.text;
                    }
                }
                if finished {
                    break;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
