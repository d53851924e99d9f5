//! Anthropic messages-API provider
//!
//! The messages protocol differs from chat completions: the system prompt
//! is a top-level string, tool use and tool results travel as typed content
//! blocks, and usage reports input/output tokens.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{
    ChatMessage, ChatResponse, FinishReason, LlmProvider, Role, ToolCallRequest, ToolSpec, Usage,
};
use crate::config::LlmSettings;
use crate::error::{AuditError, Result};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: usize,
    temperature: f64,
}

impl AnthropicProvider {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| AuditError::other(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: settings.api_key.clone().unwrap_or_default(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        })
    }

    /// Split the message list into the system string and the content turns
    fn build_body(&self, messages: &[ChatMessage], tools: Option<&[ToolSpec]>) -> Value {
        let mut system = String::new();
        let mut turns: Vec<Value> = Vec::new();

        for message in messages {
            match message.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&message.content);
                }
                Role::User => turns.push(json!({ "role": "user", "content": message.content })),
                Role::Assistant => {
                    let mut blocks: Vec<Value> = Vec::new();
                    if !message.content.is_empty() {
                        blocks.push(json!({ "type": "text", "text": message.content }));
                    }
                    for tc in &message.tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    turns.push(json!({ "role": "assistant", "content": blocks }));
                }
                Role::Tool => {
                    turns.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                            "content": message.content,
                        }]
                    }));
                }
            }
        }

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": turns,
        });
        if !system.is_empty() {
            body["system"] = Value::String(system);
        }
        if let Some(tools) = tools {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatResponse> {
        let body = self.build_body(messages, tools);
        debug!(model = %self.model, messages = messages.len(), "messages request");

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
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

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        if let Some(blocks) = body.get("content").and_then(|c| c.as_array()) {
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            content.push_str(text);
                        }
                    }
                    Some("tool_use") => {
                        tool_calls.push(ToolCallRequest {
                            id: block
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            name: block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            arguments: block
                                .get("input")
                                .cloned()
                                .unwrap_or(Value::Object(Default::default())),
                        });
                    }
                    _ => {}
                }
            }
        }

        let prompt_tokens = body
            .pointer("/usage/input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let completion_tokens = body
            .pointer("/usage/output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let usage = Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        };

        let finish_reason = match body.get("stop_reason").and_then(|v| v.as_str()) {
            Some("end_turn") => FinishReason::Stop,
            Some("tool_use") => FinishReason::ToolCalls,
            Some("max_tokens") => FinishReason::Length,
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            _ => FinishReason::Other,
        };

        if content.is_empty() && tool_calls.is_empty() {
            return Err(AuditError::llm_api("no completion content in response"));
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
