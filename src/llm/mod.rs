//! LLM provider abstraction
//!
//! One interface: `chat(messages, tools) -> ChatResponse`. Concrete
//! providers adapt the OpenAI-compatible chat-completions protocol and the
//! Anthropic messages protocol. Rate limits are retried with jittered
//! exponential backoff; non-rate-limit errors propagate immediately.

pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{LlmSettings, ProviderKind};
use crate::error::{AuditError, Result};

/// Message role on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One chat message. Tool-result messages carry the id of the call they
/// answer; assistant messages may carry tool-call requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Tool specification handed to the provider (JSON-schema parameters)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Token usage reported by the provider, zeros when absent
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Why the model stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    ToolCalls,
    Length,
    Other,
}

/// Provider response
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
    pub model: String,
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// The provider contract. Implementations are cheap to share behind an Arc
/// and safe to call concurrently.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send one chat request. `tools` enables function calling.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatResponse>;

    /// Model identifier, for logging and reports
    fn model(&self) -> &str;
}

/// Factory producing fresh provider instances; sub-agents use one so their
/// calls never serialise on a shared provider or lock
pub type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn LlmProvider>> + Send + Sync>;

/// Build a provider from settings. Non-Anthropic providers all speak the
/// OpenAI-compatible protocol against their respective base URLs.
pub fn create_provider(settings: &LlmSettings) -> Result<Arc<dyn LlmProvider>> {
    match settings.provider {
        ProviderKind::Anthropic => Ok(Arc::new(anthropic::AnthropicProvider::new(settings)?)),
        ProviderKind::Openai
        | ProviderKind::Deepseek
        | ProviderKind::Google
        | ProviderKind::Dashscope
        | ProviderKind::Ollama
        | ProviderKind::OpenaiCompatible => {
            Ok(Arc::new(openai::OpenAiCompatProvider::new(settings)?))
        }
    }
}

// ============================================================================
// Retry with jittered exponential backoff
// ============================================================================

/// Retry policy: 5 attempts, base 3s, cap 30s, jitter U[0.5, 1.5]
pub const RETRY_MAX_ATTEMPTS: u32 = 5;
pub const RETRY_BASE_DELAY_SECS: f64 = 3.0;
pub const RETRY_MAX_DELAY_SECS: f64 = 30.0;

/// Rate-limit errors are identified by substring match on the error text
/// (HTTP 429 and provider-specific codes).
pub fn is_rate_limit_error(error: &AuditError) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("429") || text.contains("rate") || text.contains("1302")
}

/// Backoff delay for attempt `n` (0-based): `min(base * 2^n, cap) * jitter`
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = (RETRY_BASE_DELAY_SECS * 2f64.powi(attempt as i32)).min(RETRY_MAX_DELAY_SECS);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(base * jitter)
}

/// Call the provider, retrying rate-limit failures with backoff. The
/// `cancelled` probe is consulted before each attempt so cancellation is
/// observed between retries. Non-rate-limit errors propagate immediately.
pub async fn chat_with_retry(
    provider: &dyn LlmProvider,
    messages: &[ChatMessage],
    tools: Option<&[ToolSpec]>,
    cancelled: impl Fn() -> bool,
) -> Result<ChatResponse> {
    let mut last_message = String::new();
    for attempt in 0..RETRY_MAX_ATTEMPTS {
        if cancelled() {
            return Err(AuditError::Cancelled);
        }
        match provider.chat(messages, tools).await {
            Ok(response) => return Ok(response),
            Err(e) if is_rate_limit_error(&e) => {
                last_message = e.to_string();
                if attempt + 1 < RETRY_MAX_ATTEMPTS {
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs_f64(),
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(AuditError::RateLimited {
        attempts: RETRY_MAX_ATTEMPTS,
        message: last_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_detection_by_substring() {
        assert!(is_rate_limit_error(&AuditError::llm_api(
            "HTTP 429 too many requests"
        )));
        assert!(is_rate_limit_error(&AuditError::llm_api("Rate limit reached")));
        assert!(!is_rate_limit_error(&AuditError::llm_api("401 unauthorized")));
    }

    #[test]
    fn backoff_grows_and_caps() {
        for attempt in 0..6 {
            let d = backoff_delay(attempt).as_secs_f64();
            let nominal =
                (RETRY_BASE_DELAY_SECS * 2f64.powi(attempt as i32)).min(RETRY_MAX_DELAY_SECS);
            assert!(d >= nominal * 0.5 - f64::EPSILON);
            assert!(d <= nominal * 1.5 + f64::EPSILON);
        }
    }

    struct FailingProvider {
        fails: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for FailingProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolSpec]>,
        ) -> Result<ChatResponse> {
            use std::sync::atomic::Ordering;
            if self.fails.fetch_sub(1, Ordering::SeqCst) > 1 {
                Err(AuditError::llm_api("429 slow down"))
            } else {
                Ok(ChatResponse {
                    content: "ok".into(),
                    ..Default::default()
                })
            }
        }

        fn model(&self) -> &str {
            "test"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_rate_limit() {
        let provider = FailingProvider {
            fails: std::sync::atomic::AtomicU32::new(3),
        };
        let messages = [ChatMessage::user("hi")];
        let handle =
            tokio::spawn(async move { chat_with_retry(&provider, &messages, None, || false).await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
            tokio::time::advance(Duration::from_secs(60)).await;
        }
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.content, "ok");
    }

    #[tokio::test]
    async fn cancellation_short_circuits_retry() {
        let provider = FailingProvider {
            fails: std::sync::atomic::AtomicU32::new(100),
        };
        let messages = [ChatMessage::user("hi")];
        let result = chat_with_retry(&provider, &messages, None, || true).await;
        assert!(matches!(result, Err(AuditError::Cancelled)));
    }
}
