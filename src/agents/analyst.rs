//! Analyst agent - Phase 1 structural analysis
//!
//! Produces (a) analysis hints: key state variables, condition thresholds,
//! cross-function dataflow, state change points and potential vulnerability
//! chains, and (b) a natural-language purpose for every function. Purposes
//! are analysed in batches with bounded concurrency.

use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{prompts::ANALYST_ROLE_PROMPT, Agent, AgentRole};
use crate::config::LlmSettings;
use crate::error::Result;
use crate::llm::LlmProvider;
use crate::toolkit::AgentToolkit;
use crate::types::CancelToken;

/// Max source characters embedded in one analysis prompt
const CODE_WINDOW: usize = 15_000;

pub struct AnalystAgent {
    agent: Agent,
}

impl AnalystAgent {
    pub fn new(
        settings: LlmSettings,
        provider: Arc<dyn LlmProvider>,
        toolkit: Arc<AgentToolkit>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            agent: Agent::new(AgentRole::Analyst, ANALYST_ROLE_PROMPT, settings, provider, cancel)
                .with_toolkit(toolkit),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Extract analysis hints from the project source. The optional
    /// call-graph context focuses the model on risky/fund-handling
    /// functions.
    pub async fn extract_analysis_hints(
        &self,
        code: &str,
        callgraph_context: Option<&str>,
    ) -> Result<Value> {
        let callgraph_section = callgraph_context
            .map(|ctx| {
                format!(
                    "\n{ctx}\n\nPay particular attention to the risky and fund-handling \
functions above and to the dependencies between them.\n"
                )
            })
            .unwrap_or_default();

        let prompt = format!(
            r#"## Task
Analyse the Move code below and extract the key information later
vulnerability-analysis passes will need.
{callgraph_section}
## Code
```move
{code}
```

## Extract

### 1. Key state variables
Flags (is_paused, is_authorized), balances/amounts, privileged addresses,
configuration parameters. For each: name, type, where it lives, why it
matters for security.

### 2. Condition thresholds
Numeric comparisons, permission checks, state checks. Copy the actual
condition expression and its threshold value.

### 3. Cross-function dataflow
Where one function's output or state write feeds another function's
logic. Express flows with arrows.

### 4. State change points
Every write to a key variable: which function, under which trigger
condition.

### 5. Potential vulnerability chains
Combinations where small issues compose into a larger one.

## Output format
```json
{{
  "key_state_variables": [{{"name": "", "type": "", "location": "", "security_relevance": ""}}],
  "condition_thresholds": [{{"condition": "", "location": "", "threshold_value": "", "security_implication": ""}}],
  "cross_function_dataflow": [{{"flow": "", "description": "", "security_concern": ""}}],
  "state_change_points": [{{"variable": "", "function": "", "trigger_condition": "", "security_implication": ""}}],
  "potential_vuln_chains": [{{"chain": "", "involved_functions": [], "description": ""}}],
  "analysis_summary": ""
}}
```

Copy real variable names, function names and conditions from the code;
do not invent anything."#,
            code = window(code),
        );

        let response = self.agent.call_llm(&prompt, None, true, false).await?;
        Ok(self
            .agent
            .parse_json_response(&response)
            .unwrap_or_else(|| serde_json::json!({})))
    }

    /// Describe what each function does, batched (`batch_size` functions
    /// per LLM call, at most `max_concurrent` calls in flight). Returns
    /// `function_id -> description`.
    pub async fn analyze_function_purposes(
        &self,
        functions: &[(String, String)], // (id, signature)
        code: &str,
        batch_size: usize,
        max_concurrent: usize,
    ) -> Result<HashMap<String, String>> {
        if functions.is_empty() {
            return Ok(HashMap::new());
        }
        let batch_size = batch_size.max(1);

        if functions.len() <= batch_size {
            return self.analyze_purpose_batch(functions, code).await;
        }

        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let batches: Vec<&[(String, String)]> = functions.chunks(batch_size).collect();
        debug!(
            functions = functions.len(),
            batches = batches.len(),
            "function purpose analysis"
        );

        let tasks = batches.into_iter().map(|batch| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                self.analyze_purpose_batch(batch, code).await
            }
        });

        let mut purposes = HashMap::new();
        for (i, outcome) in join_all(tasks).await.into_iter().enumerate() {
            match outcome {
                Ok(batch_purposes) => purposes.extend(batch_purposes),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(batch = i, error = %e, "purpose batch failed"),
            }
        }
        Ok(purposes)
    }

    async fn analyze_purpose_batch(
        &self,
        functions: &[(String, String)],
        code: &str,
    ) -> Result<HashMap<String, String>> {
        let function_list: Vec<String> = functions
            .iter()
            .map(|(id, signature)| format!("- {id}: {signature}"))
            .collect();

        let prompt = format!(
            r#"## Task
Describe the purpose of each listed function in one sentence: what it
does, what state it changes or returns, and whether it involves
permission checks or fund movement.

## Functions
{list}

## Code
```move
{code}
```

## Output format
```json
{{
  "purposes": {{
    "module::function": "one-sentence description"
  }}
}}
```"#,
            list = function_list.join("\n"),
            code = window(code),
        );

        // Stateless: purpose batches run concurrently on this instance
        let response = self.agent.call_llm(&prompt, None, true, true).await?;
        let parsed = self
            .agent
            .parse_json_response(&response)
            .unwrap_or_else(|| serde_json::json!({}));

        let mut purposes = HashMap::new();
        let map = parsed
            .get("purposes")
            .and_then(|p| p.as_object())
            .or_else(|| parsed.as_object());
        if let Some(map) = map {
            for (key, value) in map {
                if let Some(text) = value.as_str() {
                    purposes.insert(key.clone(), text.to_string());
                }
            }
        }
        Ok(purposes)
    }
}

fn window(code: &str) -> &str {
    if code.len() <= CODE_WINDOW {
        code
    } else {
        let mut cut = CODE_WINDOW;
        while !code.is_char_boundary(cut) {
            cut -= 1;
        }
        &code[..cut]
    }
}
