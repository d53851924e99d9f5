//! OpenAI-compatible chat-completions provider
//!
//! Covers OpenAI itself plus every service speaking the same protocol
//! (DeepSeek, DashScope, Ollama, Gemini's OpenAI endpoint, xAI, local
//! gateways). The base URL comes from the provider kind unless overridden.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{
    ChatMessage, ChatResponse, FinishReason, LlmProvider, Role, ToolCallRequest, ToolSpec, Usage,
};
use crate::config::{LlmSettings, ProviderKind};
use crate::error::{AuditError, Result};

/// Default base URLs per provider kind
fn default_base_url(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Openai => "https://api.openai.com/v1",
        ProviderKind::Deepseek => "https://api.deepseek.com/v1",
        ProviderKind::Google => "https://generativelanguage.googleapis.com/v1beta/openai",
        ProviderKind::Dashscope => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        ProviderKind::Ollama => "http://localhost:11434/v1",
        _ => "https://api.openai.com/v1",
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<Value>>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

/// Provider for every OpenAI-compatible backend
pub struct OpenAiCompatProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: usize,
    temperature: f64,
}

impl OpenAiCompatProvider {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| AuditError::other(format!("failed to create HTTP client: {e}")))?;

        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(settings.provider).to_string());

        Ok(Self {
            client,
            api_key: settings.api_key.clone().unwrap_or_default(),
            base_url,
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        })
    }

    fn wire_messages<'a>(messages: &'a [ChatMessage]) -> Vec<WireMessage<'a>> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let tool_calls = if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| {
                                serde_json::json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments.to_string(),
                                    }
                                })
                            })
                            .collect(),
                    )
                };
                WireMessage {
                    role,
                    content: &m.content,
                    tool_call_id: m.tool_call_id.as_deref(),
                    tool_calls,
                }
            })
            .collect()
    }

    fn wire_tools(tools: &[ToolSpec]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatResponse> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: Self::wire_messages(messages),
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            tools: tools.map(Self::wire_tools),
        };

        debug!(model = %self.model, messages = messages.len(), "chat completions request");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| AuditError::llm_api(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AuditError::llm_api(format!(
                "API returned {status}: {error_text}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AuditError::llm_api(format!("failed to parse response: {e}")))?;

        let content = body
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = body
            .pointer("/choices/0/message/tool_calls")
            .and_then(|v| v.as_array())
        {
            for call in calls {
                let id = call.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let name = call
                    .pointer("/function/name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                // arguments arrive as a JSON-encoded string
                let arguments = call
                    .pointer("/function/arguments")
                    .and_then(|v| v.as_str())
                    .and_then(|s| serde_json::from_str::<Value>(s).ok())
                    .unwrap_or(Value::Object(Default::default()));
                if !name.is_empty() {
                    tool_calls.push(ToolCallRequest { id, name, arguments });
                }
            }
        }

        let usage = body
            .get("usage")
            .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
            .unwrap_or_default();

        let finish_reason = match body
            .pointer("/choices/0/finish_reason")
            .and_then(|v| v.as_str())
        {
            Some("stop") => FinishReason::Stop,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some("length") => FinishReason::Length,
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            _ => FinishReason::Other,
        };

        if content.is_empty() && tool_calls.is_empty() {
            let keys: Vec<String> = body
                .as_object()
                .map(|o| o.keys().cloned().collect())
                .unwrap_or_default();
            return Err(AuditError::llm_api(format!(
                "no completion content in response, keys: {keys:?}"
            )));
        }

        Ok(ChatResponse {
            content,
            tool_calls,
            usage,
            model: self.model.clone(),
            finish_reason,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}
