use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chain::ChainMode;
use crate::error::{Result, TasklaneError};

const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1/chat/completions";

/// Top-level Tasklane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub flow: FlowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Flow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Node-dispatch budget per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_mode")]
    pub mode: ChainMode,
    /// Length of the output summary stored on a completed step.
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
    /// Broadcast buffer size for the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            mode: default_mode(),
            summary_chars: default_summary_chars(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_steps() -> usize { 50 }
fn default_mode() -> ChainMode { ChainMode::Autonomous }
fn default_summary_chars() -> usize { 200 }
fn default_event_capacity() -> usize { 256 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TasklaneError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse TOML text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| TasklaneError::Config(e.to_string()))
    }

    /// Build a config from the environment when no file exists.
    /// `OPENAI_API_KEY` selects OpenAI; otherwise a local Ollama endpoint.
    pub fn from_env() -> Self {
        let model = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => ModelConfig {
                provider: "openai".to_string(),
                model_id: "gpt-4o".to_string(),
                api_key: Some(key),
                base_url: None,
                max_tokens: default_max_tokens(),
                temperature: default_temperature(),
                retry: None,
                extra_headers: HashMap::new(),
            },
            Err(_) => ModelConfig {
                provider: "ollama".to_string(),
                model_id: "llama3.2".to_string(),
                api_key: None,
                base_url: Some(OLLAMA_BASE_URL.to_string()),
                max_tokens: default_max_tokens(),
                temperature: default_temperature(),
                retry: None,
                extra_headers: HashMap::new(),
            },
        };

        Self {
            model,
            fallback_models: Vec::new(),
            flow: FlowConfig::default(),
        }
    }

    /// Copy with API keys masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for model in std::iter::once(&mut copy.model).chain(copy.fallback_models.iter_mut()) {
            if model.api_key.is_some() {
                model.api_key = Some("***".to_string());
            }
        }
        copy
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
