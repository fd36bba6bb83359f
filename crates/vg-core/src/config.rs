//! VaultGraph Configuration Management
//!
//! Handles configuration from environment variables, config files,
//! and command-line arguments with sensible defaults for development.
//! Storage locations are explicit values here; nothing is created on disk
//! until a component's `init` step runs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Extraction request tuning and retry policy
    pub extraction: ExtractionConfig,

    /// Snapshot storage and batch behavior
    pub storage: StorageConfig,

    /// Query engine limits
    pub query: QueryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        self.apply_env()?;
        Ok(self)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // LLM
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            self.llm.openai_base_url = Some(url);
        }
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            self.llm.ollama_url = url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(model) = std::env::var("LLM_RETRY_MODEL") {
            self.llm.retry_model = model;
        }
        if let Ok(secs) = std::env::var("LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env("LLM_TIMEOUT_SECS", secs)?;
        }

        // Extraction
        if let Ok(retries) = std::env::var("MAX_RETRIES") {
            self.extraction.max_retries = parse_env("MAX_RETRIES", retries)?;
        }

        // Storage
        if let Ok(dir) = std::env::var("GRAPH_DATA_DIR") {
            self.storage.root = PathBuf::from(dir);
        }
        if let Ok(every) = std::env::var("CHECKPOINT_EVERY") {
            self.storage.checkpoint_every = parse_env("CHECKPOINT_EVERY", every)?;
        }
        if let Ok(n) = std::env::var("EXTRACTION_CONCURRENCY") {
            self.storage.concurrency = parse_env("EXTRACTION_CONCURRENCY", n)?;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = std::env::var("LOG_JSON") {
            self.logging.json_format = parse_env("LOG_JSON", json)?;
        }

        Ok(())
    }

    /// Reject configurations that cannot start a run
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.llm.provider {
            LlmProvider::Anthropic if self.llm.anthropic_api_key.is_none() => {
                return Err(ConfigError::MissingRequired("ANTHROPIC_API_KEY".to_string()));
            }
            LlmProvider::OpenAI if self.llm.openai_api_key.is_none() => {
                return Err(ConfigError::MissingRequired("OPENAI_API_KEY".to_string()));
            }
            _ => {}
        }

        if self.extraction.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_RETRIES".to_string(),
                value: "0".to_string(),
            });
        }
        if self.storage.checkpoint_every == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHECKPOINT_EVERY".to_string(),
                value: "0".to_string(),
            });
        }
        if self.storage.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EXTRACTION_CONCURRENCY".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// LLM provider to use
    pub provider: LlmProvider,

    /// Anthropic API key
    pub anthropic_api_key: Option<String>,

    /// OpenAI API key
    pub openai_api_key: Option<String>,

    /// OpenAI API base URL (for Azure or compatible APIs)
    pub openai_base_url: Option<String>,

    /// Ollama server URL
    pub ollama_url: String,

    /// Model used for extraction
    pub model: String,

    /// More capable model used when retrying failed chunks
    pub retry_model: String,

    /// Hard per-call deadline in seconds
    pub timeout_secs: u64,
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            anthropic_api_key: None,
            openai_api_key: None,
            openai_base_url: None,
            ollama_url: "http://localhost:11434".to_string(),
            model: "claude-haiku-4-5".to_string(),
            retry_model: "claude-sonnet-4-5".to_string(),
            timeout_secs: 120,
        }
    }
}

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Anthropic,
    OpenAI,
    Ollama,
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            _ => Err(ConfigError::InvalidValue {
                key: "LLM_PROVIDER".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Extraction request tuning and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Chunks shorter than this (trimmed, in chars) are never sent
    pub min_chunk_chars: usize,

    /// Input cap to respect model context limits
    pub max_input_chars: usize,

    /// Output tokens on a first attempt
    pub max_tokens: u32,

    /// Output tokens on retries
    pub retry_max_tokens: u32,

    /// Sampling temperature on a first attempt
    pub temperature: f32,

    /// Sampling temperature on retries
    pub retry_temperature: f32,

    /// Total attempts per chunk
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    pub max_delay_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_chunk_chars: 50,
            max_input_chars: 8000,
            max_tokens: 4096,
            retry_max_tokens: 6000,
            temperature: 0.3,
            retry_temperature: 0.1,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// Snapshot storage and batch behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding checkpoints, exports and failed-chunk artifacts
    pub root: PathBuf,

    /// Snapshot after this many processed chunks
    pub checkpoint_every: usize,

    /// Skip chunks whose identity hash was already processed
    pub skip_processed: bool,

    /// Extraction requests in flight (merges stay sequential)
    pub concurrency: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("graph_data"),
            checkpoint_every: 10,
            skip_processed: true,
            concurrency: 1,
        }
    }
}

/// Query engine limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Maximum path length in edges
    pub max_depth: usize,

    /// Maximum number of paths returned
    pub max_paths: usize,

    /// Entities listed by graph statistics
    pub top_k: usize,

    /// Relationships per direction rendered into LLM context
    pub context_edge_limit: usize,

    /// Entities pulled into a question's context
    pub max_context_entities: usize,

    /// Output tokens for question answering
    pub answer_max_tokens: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_paths: 10,
            top_k: 10,
            context_edge_limit: 10,
            max_context_entities: 20,
            answer_max_tokens: 3000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}
