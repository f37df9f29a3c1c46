//! Generator Adapter contract (§6): `chat(messages, temperature,
//! max_tokens) -> text`, with the adapter responsible for its own
//! exponential-backoff retry. An external collaborator per §1 — the core
//! depends only on the `GeneratorAdapter` trait.

pub mod openai;
pub mod parsing;

use async_trait::async_trait;

use crate::error::GeneratorError;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user",
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait GeneratorAdapter: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, GeneratorError>;

    fn model(&self) -> &str;
    fn provider(&self) -> &str;
}

/// Shared exponential-backoff retry loop (`delay * 2^attempt`, capped),
/// the same shape as `bpmn_integration/event_bridge.rs`'s reconnect
/// backoff in the teacher repo. Concrete adapters call this around
/// their own single-request implementation so every adapter gets the
/// same retry discipline without duplicating the loop.
pub async fn chat_with_backoff<F, Fut>(
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    mut attempt_once: F,
) -> Result<String, GeneratorError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<String, GeneratorError>>,
{
    let mut attempt = 0u32;

    let last_error = loop {
        match attempt_once().await {
            Ok(text) => return Ok(text),
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    break e;
                }
                let backoff = initial_backoff_ms
                    .saturating_mul(2u64.saturating_pow(attempt - 1))
                    .min(max_backoff_ms);
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }
        }
    };

    Err(GeneratorError::RetriesExhausted {
        attempts: attempt,
        last_error: last_error.to_string(),
    })
}
