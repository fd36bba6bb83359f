//! LLM Client implementations
//!
//! Concrete adapters for the `LlmClient` capability: Anthropic Messages,
//! OpenAI-compatible chat completions and Ollama. Adapters are chosen once
//! at construction from configuration; extraction code only sees the trait.
//!
//! Author: hephaex@gmail.com

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use vg_core::{CompletionRequest, LlmClient, LlmConfig, LlmProvider, Result, VgError};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

fn http_client(config: &LlmConfig) -> Result<Client> {
    Client::builder()
        .timeout(config.timeout())
        .build()
        .map_err(|e| VgError::ConfigError(format!("Failed to build HTTP client: {e}")))
}

async fn error_for_status(provider: &str, response: reqwest::Response) -> VgError {
    let status = response.status();
    let error_text = response.text().await.unwrap_or_default();
    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => "rate limited",
        s if s.is_server_error() => "server error",
        _ => "request rejected",
    };
    VgError::LlmError(format!("{provider} {kind} ({status}): {error_text}"))
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

impl Message {
    fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

// ============================================================================
// Anthropic Client
// ============================================================================

/// Anthropic Messages API client
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .anthropic_api_key
            .as_ref()
            .ok_or_else(|| VgError::ConfigError("Anthropic API key required".to_string()))?;

        Ok(Self {
            client: http_client(config)?,
            api_key: api_key.clone(),
            base_url: ANTHROPIC_BASE_URL.to_string(),
        })
    }

    /// Set custom base URL (for proxies or gateways)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = AnthropicRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![Message::user(&request.prompt)],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| VgError::LlmError(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(error_for_status("Anthropic", response).await);
        }

        let result: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| VgError::LlmError(format!("Failed to parse response: {e}")))?;

        let text: String = result
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();

        if text.is_empty() {
            return Err(VgError::LlmError("No response generated".to_string()));
        }
        Ok(text.trim().to_string())
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

// ============================================================================
// OpenAI Client
// ============================================================================

/// OpenAI API client
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl OpenAiClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| VgError::ConfigError("OpenAI API key required".to_string()))?;

        let base_url = config
            .openai_base_url
            .clone()
            .unwrap_or_else(|| OPENAI_BASE_URL.to_string());

        Ok(Self {
            client: http_client(config)?,
            api_key: api_key.clone(),
            base_url,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = OpenAiRequest {
            model: &request.model,
            messages: vec![Message::user(&request.prompt)],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| VgError::LlmError(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(error_for_status("OpenAI", response).await);
        }

        let result: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| VgError::LlmError(format!("Failed to parse response: {e}")))?;

        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| VgError::LlmError("No response generated".to_string()))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ============================================================================
// Ollama Client
// ============================================================================

/// Ollama API client
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.ollama_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = OllamaRequest {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| VgError::LlmError(format!("Ollama request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(error_for_status("Ollama", response).await);
        }

        let result: OllamaResponse = response
            .json()
            .await
            .map_err(|e| VgError::LlmError(format!("Failed to parse Ollama response: {e}")))?;

        Ok(result.response.trim().to_string())
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

// ============================================================================
// Factory function
// ============================================================================

/// Create an LLM client from config
pub fn create_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider {
        LlmProvider::Anthropic => Ok(Arc::new(AnthropicClient::from_config(config)?)),
        LlmProvider::OpenAI => Ok(Arc::new(OpenAiClient::from_config(config)?)),
        LlmProvider::Ollama => Ok(Arc::new(OllamaClient::from_config(config)?)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anthropic_requires_key() {
        let config = LlmConfig::default();
        assert!(matches!(
            AnthropicClient::from_config(&config),
            Err(VgError::ConfigError(_))
        ));
    }

    #[test]
    fn test_factory_picks_provider() {
        let config = LlmConfig {
            provider: LlmProvider::Ollama,
            ollama_url: "http://localhost:11434/".to_string(),
            ..Default::default()
        };
        let client = create_llm_client(&config).unwrap();
        assert_eq!(client.name(), "ollama");

        let config = LlmConfig {
            provider: LlmProvider::OpenAI,
            openai_api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        assert_eq!(create_llm_client(&config).unwrap().name(), "openai");
    }

    #[test]
    fn test_anthropic_request_shape() {
        let body = AnthropicRequest {
            model: "claude-haiku-4-5",
            max_tokens: 4096,
            temperature: 0.3,
            messages: vec![Message::user("hi")],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 4096);
    }

    #[test]
    fn test_anthropic_response_text_blocks() {
        let response: AnthropicResponse = serde_json::from_str(
            r#"{"content": [{"type": "text", "text": "{\"entities\": []}"}, {"type": "tool_use", "id": "x"}]}"#,
        )
        .unwrap();
        let text: String = response
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();
        assert_eq!(text, "{\"entities\": []}");
    }
}
