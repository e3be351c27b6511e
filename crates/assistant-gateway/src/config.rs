// assistant-gateway/src/config.rs

use crate::capabilities::SamplingParams;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorBackend {
    Ollama,
    LlamaServer,
}

impl FromStr for GeneratorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(GeneratorBackend::Ollama),
            "llama-server" | "llama_server" | "llama" => Ok(GeneratorBackend::LlamaServer),
            other => Err(anyhow::anyhow!("Unknown GENERATOR_BACKEND '{}', expected ollama or llama-server", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub generator_backend: GeneratorBackend,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub llama_server_url: String,
    pub max_new_tokens: u32,
    pub default_temperature: f32,
    pub default_top_p: f32,
    pub default_top_k: u32,
    pub generate_timeout_seconds: u64,
    pub brave_search_api_key: Option<String>,
    pub brave_search_api_url: String,
    pub search_result_count: u32,
    pub github_token: Option<String>,
    pub github_api_url: String,
    pub files_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/memory.db"),
            generator_backend: GeneratorBackend::Ollama,
            ollama_base_url: "http://127.0.0.1:11434".into(),
            ollama_model: "gemma3:12b".into(),
            llama_server_url: "http://127.0.0.1:8081".into(),
            max_new_tokens: 2048,
            default_temperature: 0.7,
            default_top_p: 0.9,
            default_top_k: 50,
            generate_timeout_seconds: 300,
            brave_search_api_key: None,
            brave_search_api_url: "https://api.search.brave.com/res/v1/web/search".into(),
            search_result_count: 5,
            github_token: None,
            github_api_url: "https://api.github.com".into(),
            files_root: default_files_root(),
        }
    }
}

fn default_files_root() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Unset and blank variables both count as absent.
fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_var(name) {
        Some(raw) => raw.parse().with_context(|| format!("{} has an invalid value '{}'", name, raw)),
        None => Ok(default),
    }
}

impl Config {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_vars()
    }

    /// Read configuration from the current environment only.
    pub fn from_vars() -> Result<Self> {
        let defaults = Self::default();
        let generator_backend = match optional_var("GENERATOR_BACKEND") {
            Some(raw) => raw.parse()?,
            None => defaults.generator_backend,
        };

        let config = Self {
            database_path: optional_var("DATABASE_PATH").map(PathBuf::from).unwrap_or(defaults.database_path),
            generator_backend,
            ollama_base_url: optional_var("OLLAMA_BASE_URL").unwrap_or(defaults.ollama_base_url),
            ollama_model: optional_var("OLLAMA_MODEL_NAME").unwrap_or(defaults.ollama_model),
            llama_server_url: optional_var("LLAMA_SERVER_URL").unwrap_or(defaults.llama_server_url),
            max_new_tokens: parsed_var("MAX_NEW_TOKENS", defaults.max_new_tokens)?,
            default_temperature: parsed_var("DEFAULT_TEMPERATURE", defaults.default_temperature)?,
            default_top_p: parsed_var("DEFAULT_TOP_P", defaults.default_top_p)?,
            default_top_k: parsed_var("DEFAULT_TOP_K", defaults.default_top_k)?,
            generate_timeout_seconds: parsed_var("GENERATE_TIMEOUT_SECONDS", defaults.generate_timeout_seconds)?,
            brave_search_api_key: optional_var("BRAVE_SEARCH_API_KEY"),
            brave_search_api_url: optional_var("BRAVE_SEARCH_API_URL").unwrap_or(defaults.brave_search_api_url),
            search_result_count: parsed_var("SEARCH_RESULT_COUNT", defaults.search_result_count)?,
            github_token: optional_var("GITHUB_TOKEN"),
            github_api_url: optional_var("GITHUB_API_URL").unwrap_or(defaults.github_api_url),
            files_root: optional_var("FILES_ROOT").map(PathBuf::from).unwrap_or(defaults.files_root),
        };

        if config.brave_search_api_key.is_none() {
            warn!("BRAVE_SEARCH_API_KEY not set; web searches will report failure");
        }
        if config.github_token.is_none() {
            warn!("GITHUB_TOKEN not set; code-host operations will report failure");
        }
        info!(
            "Generator: {:?}, database: {}, files root: {}",
            config.generator_backend,
            config.database_path.display(),
            config.files_root.display()
        );
        Ok(config)
    }

    /// Sampling applied when a turn leaves a parameter unset.
    pub fn generation_defaults(&self) -> SamplingParams {
        SamplingParams {
            max_tokens: self.max_new_tokens,
            temperature: self.default_temperature,
            top_p: self.default_top_p,
            top_k: self.default_top_k,
        }
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &["GENERATOR_BACKEND", "MAX_NEW_TOKENS", "DEFAULT_TOP_K", "GITHUB_TOKEN", "FILES_ROOT"];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults_without_environment() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        let config = Config::from_vars().unwrap();
        assert_eq!(config.generator_backend, GeneratorBackend::Ollama);
        assert_eq!(config.generation_defaults(), SamplingParams::default());
        assert!(config.github_token.is_none());
    }

    #[test]
    fn test_overrides_and_blank_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        env::set_var("GENERATOR_BACKEND", "llama-server");
        env::set_var("MAX_NEW_TOKENS", "512");
        env::set_var("GITHUB_TOKEN", "  ");
        env::set_var("FILES_ROOT", "/srv/files");

        let config = Config::from_vars().unwrap();
        assert_eq!(config.generator_backend, GeneratorBackend::LlamaServer);
        assert_eq!(config.generation_defaults().max_tokens, 512);
        assert!(config.github_token.is_none());
        assert_eq!(config.files_root, PathBuf::from("/srv/files"));
        clear();
    }

    #[test]
    fn test_unparsable_number_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        env::set_var("DEFAULT_TOP_K", "many");
        let err = Config::from_vars().unwrap_err();
        assert!(err.to_string().contains("DEFAULT_TOP_K"));
        clear();
    }
}
