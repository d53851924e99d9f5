//! LLM agents
//!
//! All roles share one `Agent` core; a role is configuration (prompt plus
//! tool subset), not a subclass. The core provides:
//!
//! - `call_llm`: plain chat with rate-limit retry. Stateful calls append to
//!   the per-instance conversation history under an async mutex; stateless
//!   calls never touch the history and bypass the lock entirely, so they
//!   can run concurrently on a shared instance.
//! - `call_llm_with_tools`: the tool-call loop. Tool requests are executed
//!   against the toolkit, results are fed back as tool messages, repeated
//!   calls are served from a per-call dedup cache, and when the round
//!   budget runs out a final "output JSON now" request (without tool
//!   specs) forces a text answer.
//! - `verify_lightweight`: an isolated sub-agent - fresh provider, fresh
//!   message list, capped tool budget - whose terminal token usage merges
//!   back into this agent's counters.

pub mod analyst;
pub mod auditor;
pub mod manager;
pub mod prompts;
pub mod verifier;
pub mod whitehat;

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::LlmSettings;
use crate::error::Result;
use crate::json_repair::{robust_parse_json, FieldPattern};
use crate::llm::{
    chat_with_retry, create_provider, ChatMessage, ChatResponse, LlmProvider, ProviderFactory,
    ToolSpec,
};
use crate::toolkit::AgentToolkit;
use crate::types::{CancelToken, TokenCounters, TokenUsage};

/// Agent roles. The difference between roles is prompt + tool subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Manager,
    Analyst,
    Auditor,
    Verifier,
    WhiteHat,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Manager => "manager",
            AgentRole::Analyst => "analyst",
            AgentRole::Auditor => "auditor",
            AgentRole::Verifier => "verifier",
            AgentRole::WhiteHat => "whitehat",
        }
    }
}

const JSON_MODE_SUFFIX: &str = "\n\nRespond with a single JSON object and nothing else.";

const TOOL_GUIDANCE: &str = "\n\n## Tool usage\nWhen you call a tool, state in one sentence what \
you need and why. Use the tool-calling mechanism itself; never print `tool_calls:` as text.";

/// Maximum unique tool calls executed per sub-agent round
const SUB_AGENT_TOOLS_PER_ROUND: usize = 2;

/// One role-configured LLM agent instance
pub struct Agent {
    role: AgentRole,
    role_prompt: String,
    settings: LlmSettings,
    provider: Arc<dyn LlmProvider>,
    toolkit: Option<Arc<AgentToolkit>>,
    /// Conversation history; the mutex also serialises stateful calls
    history: Mutex<Vec<ChatMessage>>,
    counters: TokenCounters,
    cancel: CancelToken,
    /// Override for sub-agent provider construction (defaults to a fresh
    /// provider from the settings)
    sub_provider_factory: Option<ProviderFactory>,
}

impl Agent {
    pub fn new(
        role: AgentRole,
        role_prompt: impl Into<String>,
        settings: LlmSettings,
        provider: Arc<dyn LlmProvider>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            role,
            role_prompt: role_prompt.into(),
            settings,
            provider,
            toolkit: None,
            history: Mutex::new(Vec::new()),
            counters: TokenCounters::new(),
            cancel,
            sub_provider_factory: None,
        }
    }

    pub fn with_toolkit(mut self, toolkit: Arc<AgentToolkit>) -> Self {
        self.toolkit = Some(toolkit);
        self
    }

    pub fn with_sub_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.sub_provider_factory = Some(factory);
        self
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn toolkit(&self) -> Option<&Arc<AgentToolkit>> {
        self.toolkit.as_ref()
    }

    /// Cumulative token usage including sub-agent calls
    pub fn token_usage(&self) -> TokenUsage {
        self.counters.snapshot()
    }

    pub async fn reset_conversation(&self) {
        self.history.lock().await.clear();
    }

    fn track(&self, response: &ChatResponse) {
        self.counters.track(
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
            response.usage.total_tokens,
        );
    }

    fn cancelled_probe(&self) -> impl Fn() -> bool + '_ {
        move || self.cancel.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Plain calls
    // ------------------------------------------------------------------

    /// One chat call. With `stateless` the conversation history is neither
    /// read nor written and no lock is taken - the concurrency fast path.
    pub async fn call_llm(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        json_mode: bool,
        stateless: bool,
    ) -> Result<String> {
        let mut system = system_prompt.unwrap_or(self.role_prompt.as_str()).to_string();
        if json_mode {
            system.push_str(JSON_MODE_SUFFIX);
        }

        if stateless {
            let messages = vec![ChatMessage::system(system), ChatMessage::user(prompt)];
            let response = chat_with_retry(
                self.provider.as_ref(),
                &messages,
                None,
                self.cancelled_probe(),
            )
            .await?;
            self.track(&response);
            return Ok(response.content);
        }

        // Stateful: the lock covers the provider call and the history append
        let mut history = self.history.lock().await;
        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(prompt));

        let response = chat_with_retry(
            self.provider.as_ref(),
            &messages,
            None,
            self.cancelled_probe(),
        )
        .await?;
        self.track(&response);

        history.push(ChatMessage::user(prompt));
        history.push(ChatMessage::assistant(response.content.clone()));
        Ok(response.content)
    }

    // ------------------------------------------------------------------
    // Tool-call loop
    // ------------------------------------------------------------------

    /// Chat with tool access. The model decides which tools to call; each
    /// request is executed and fed back until the model answers in text or
    /// the round budget is exhausted.
    pub async fn call_llm_with_tools(
        &self,
        prompt: &str,
        tools: &[ToolSpec],
        max_tool_rounds: usize,
        json_mode: bool,
    ) -> Result<String> {
        let Some(toolkit) = self.toolkit.clone() else {
            return self.call_llm(prompt, None, json_mode, true).await;
        };
        if tools.is_empty() {
            return self.call_llm(prompt, None, json_mode, true).await;
        }

        let mut system = self.role_prompt.clone();
        if json_mode {
            system.push_str(JSON_MODE_SUFFIX);
        }
        system.push_str(TOOL_GUIDANCE);

        let mut messages = vec![ChatMessage::system(system), ChatMessage::user(prompt)];
        let mut result_cache: HashMap<String, String> = HashMap::new();
        let mut last_response: Option<ChatResponse> = None;

        for round in 0..max_tool_rounds {
            let response = {
                // serialise same-instance provider calls; messages stay local
                let _guard = self.history.lock().await;
                chat_with_retry(
                    self.provider.as_ref(),
                    &messages,
                    Some(tools),
                    self.cancelled_probe(),
                )
                .await?
            };
            self.track(&response);

            if !response.has_tool_calls() {
                debug!(role = self.role.as_str(), rounds = round + 1, "tool loop finished");
                return Ok(response.content);
            }

            debug!(
                role = self.role.as_str(),
                round = round + 1,
                requests = response.tool_calls.len(),
                "tool calls requested"
            );

            let mut fresh = 0usize;
            let assistant =
                ChatMessage::assistant_with_tool_calls(response.content.clone(), response.tool_calls.clone());
            messages.push(assistant);

            for tc in &response.tool_calls {
                let key = cache_key(&tc.name, &tc.arguments);
                let output = match result_cache.get(&key) {
                    Some(cached) => cached.clone(),
                    None => {
                        fresh += 1;
                        let result = toolkit.call_tool(&tc.name, &tc.arguments, self.role.as_str());
                        let output = result.to_tool_message();
                        result_cache.insert(key, output.clone());
                        output
                    }
                };
                messages.push(ChatMessage::tool_result(tc.id.clone(), output));
            }

            if fresh == 0 {
                debug!(
                    role = self.role.as_str(),
                    "all tool calls served from cache, nudging the model onward"
                );
            }
            last_response = Some(response);
        }

        // Round budget exhausted: demand the final answer without tool specs
        warn!(
            role = self.role.as_str(),
            max_tool_rounds, "tool round budget exhausted, forcing final output"
        );
        messages.push(ChatMessage::user(format!(
            "Stop calling tools. Based on everything gathered so far, output the final result now.{}",
            if json_mode { " Respond with JSON only." } else { "" }
        )));
        let final_response = {
            let _guard = self.history.lock().await;
            chat_with_retry(
                self.provider.as_ref(),
                &messages,
                None,
                self.cancelled_probe(),
            )
            .await
        };
        match final_response {
            Ok(response) => {
                self.track(&response);
                Ok(response.content)
            }
            Err(e) => {
                warn!(role = self.role.as_str(), error = %e, "forced final output failed");
                Ok(last_response.map(|r| r.content).unwrap_or_default())
            }
        }
    }

    // ------------------------------------------------------------------
    // Sub-agent verification
    // ------------------------------------------------------------------

    /// Run an isolated verification sub-agent: a fresh provider instance
    /// (no lock sharing with this agent), a fresh message list, a short
    /// tool loop with at most two unique tool calls per round and call
    /// deduplication. The sub-agent's usage merges into this agent's
    /// counters.
    pub async fn verify_lightweight(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tool_rounds: usize,
        field_patterns: &[FieldPattern],
    ) -> Result<Value> {
        let Some(toolkit) = self.toolkit.clone() else {
            return Err(crate::error::AuditError::other(
                "verify_lightweight requires a toolkit",
            ));
        };
        let sub_provider = match &self.sub_provider_factory {
            Some(factory) => factory()?,
            None => create_provider(&self.settings)?,
        };
        let tools = toolkit.security_tools();
        let sub_usage = TokenCounters::new();

        let mut messages = vec![
            ChatMessage::system(system_prompt.to_string()),
            ChatMessage::user(user_prompt.to_string()),
        ];
        let mut called: HashSet<String> = HashSet::new();

        let parse = |content: &str| -> Value {
            robust_parse_json(content, field_patterns).unwrap_or_else(|| {
                serde_json::json!({ "error": "parse_failed", "raw": truncate_chars(content, 500) })
            })
        };

        let outcome = async {
            for _round in 0..max_tool_rounds {
                let response = chat_with_retry(
                    sub_provider.as_ref(),
                    &messages,
                    Some(&tools),
                    self.cancelled_probe(),
                )
                .await?;
                sub_usage.track(
                    response.usage.prompt_tokens,
                    response.usage.completion_tokens,
                    response.usage.total_tokens,
                );

                if !response.has_tool_calls() {
                    return Ok(parse(&response.content));
                }

                // Drop repeats, cap the per-round budget
                let unique: Vec<_> = response
                    .tool_calls
                    .iter()
                    .filter(|tc| called.insert(cache_key(&tc.name, &tc.arguments)))
                    .take(SUB_AGENT_TOOLS_PER_ROUND)
                    .cloned()
                    .collect();

                if unique.is_empty() {
                    messages.push(ChatMessage::user("Output the JSON result now."));
                    let final_resp = chat_with_retry(
                        sub_provider.as_ref(),
                        &messages,
                        None,
                        self.cancelled_probe(),
                    )
                    .await?;
                    sub_usage.track(
                        final_resp.usage.prompt_tokens,
                        final_resp.usage.completion_tokens,
                        final_resp.usage.total_tokens,
                    );
                    return Ok(parse(&final_resp.content));
                }

                messages.push(ChatMessage::assistant_with_tool_calls(
                    response.content.clone(),
                    unique.clone(),
                ));
                for tc in &unique {
                    let result = toolkit.call_tool(
                        &tc.name,
                        &tc.arguments,
                        &format!("sub-{}", self.role.as_str()),
                    );
                    messages.push(ChatMessage::tool_result(
                        tc.id.clone(),
                        truncate_chars(&result.to_tool_message(), 2000),
                    ));
                }
            }

            // Rounds exhausted
            messages.push(ChatMessage::user("Output the JSON result now."));
            let final_resp = chat_with_retry(
                sub_provider.as_ref(),
                &messages,
                None,
                self.cancelled_probe(),
            )
            .await?;
            sub_usage.track(
                final_resp.usage.prompt_tokens,
                final_resp.usage.completion_tokens,
                final_resp.usage.total_tokens,
            );
            Ok(parse(&final_resp.content))
        }
        .await;

        // Merge the terminal usage record whatever the outcome
        self.counters.merge(&sub_usage.snapshot());
        outcome
    }

    /// Parse an LLM response through the repair ladder, with role-specific
    /// field extraction as the last strategy.
    pub fn parse_json_response(&self, response: &str) -> Option<Value> {
        let patterns: &[FieldPattern] = match self.role {
            AgentRole::Verifier | AgentRole::Manager => crate::json_repair::VERIFIER_FIELDS,
            AgentRole::WhiteHat => crate::json_repair::WHITEHAT_FIELDS,
            _ => &[],
        };
        robust_parse_json(response, patterns)
    }
}

/// Dedup key: tool name + canonicalised (key-sorted) arguments
pub fn cache_key(name: &str, args: &Value) -> String {
    format!("{name}:{}", canonical_json(args))
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k.as_str()])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect::<String>() + "..."
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuditError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted provider: returns canned responses in sequence
    pub(crate) struct ScriptedProvider {
        responses: Mutex<Vec<ChatResponse>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn text(content: &str) -> ChatResponse {
            ChatResponse {
                content: content.to_string(),
                usage: crate::llm::Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolSpec]>,
        ) -> crate::error::Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                Err(AuditError::llm_api("script exhausted"))
            } else {
                Ok(responses.remove(0))
            }
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    fn agent(provider: Arc<dyn LlmProvider>) -> Agent {
        Agent::new(
            AgentRole::Verifier,
            "You verify findings.",
            LlmSettings::default(),
            provider,
            CancelToken::new(),
        )
    }

    #[tokio::test]
    async fn stateful_call_appends_history() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::text("first"),
            ScriptedProvider::text("second"),
        ]));
        let agent = agent(provider);
        assert_eq!(agent.call_llm("hello", None, false, false).await.unwrap(), "first");
        assert_eq!(agent.call_llm("again", None, false, false).await.unwrap(), "second");
        assert_eq!(agent.history.lock().await.len(), 4);
        let usage = agent.token_usage();
        assert_eq!(usage.call_count, 2);
        assert_eq!(usage.total_tokens, 30);
    }

    #[tokio::test]
    async fn stateless_call_skips_history() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text("out")]));
        let agent = agent(provider);
        agent.call_llm("hello", None, false, true).await.unwrap();
        assert!(agent.history.lock().await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_calls() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text("x")]));
        let cancel = CancelToken::new();
        let agent = Agent::new(
            AgentRole::Auditor,
            "prompt",
            LlmSettings::default(),
            provider,
            cancel.clone(),
        );
        cancel.cancel();
        let result = agent.call_llm("hello", None, false, true).await;
        assert!(matches!(result, Err(AuditError::Cancelled)));
    }

    #[test]
    fn cache_key_is_order_insensitive() {
        let a = serde_json::json!({"module": "pool", "function": "repay"});
        let b = serde_json::json!({"function": "repay", "module": "pool"});
        assert_eq!(cache_key("get_function_code", &a), cache_key("get_function_code", &b));
    }
}
