//! OpenAI-compatible chat completion client. Grounded on
//! `ai::openai::OpenAiClient` in the teacher repo: same request/response
//! shapes, same error mapping (rate limit / auth / generic API error),
//! wrapped in the shared backoff loop from `super::chat_with_backoff`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{chat_with_backoff, ChatMessage, GeneratorAdapter};
use crate::error::GeneratorError;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        OpenAiConfig {
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

pub struct OpenAiGenerator {
    config: OpenAiConfig,
    client: Client,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiErrorDetail,
}

#[derive(Deserialize)]
struct OpenAiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

impl OpenAiGenerator {
    pub fn new(config: OpenAiConfig) -> Result<Self, GeneratorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| GeneratorError::RequestFailed(e.to_string()))?;
        Ok(OpenAiGenerator { config, client })
    }

    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, GeneratorError> {
        let request = OpenAiRequest {
            model: &self.config.model,
            messages: messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
            max_tokens,
            temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| GeneratorError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GeneratorError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            error!(status = %status, body = %body, "generator API error");
            if let Ok(err_response) = serde_json::from_str::<OpenAiErrorResponse>(&body) {
                return Err(GeneratorError::RequestFailed(format!(
                    "{}: {}",
                    err_response.error.error_type, err_response.error.message
                )));
            }
            return Err(GeneratorError::RequestFailed(format!(
                "HTTP {status} - {body}"
            )));
        }

        let parsed: OpenAiResponse = serde_json::from_str(&body)
            .map_err(|e| GeneratorError::ParseError(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GeneratorError::ParseError("no choices in response".to_string()))?;

        debug!(chars = content.len(), "generator response received");
        Ok(content)
    }
}

#[async_trait]
impl GeneratorAdapter for OpenAiGenerator {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, GeneratorError> {
        chat_with_backoff(
            self.config.max_retries,
            self.config.initial_backoff_ms,
            self.config.max_backoff_ms,
            || self.chat_once(messages, temperature, max_tokens),
        )
        .await
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn provider(&self) -> &str {
        "OPENAI"
    }
}
