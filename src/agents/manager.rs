//! Manager agent
//!
//! Adjudicates low-confidence verification verdicts. The current pipeline
//! policy short-circuits the manager (needs_review escalates to confirmed
//! for human review instead), but the role stays available as a
//! configuration option for stricter policies.

use serde_json::Value;
use std::sync::Arc;

use super::{prompts::MANAGER_ROLE_PROMPT, Agent, AgentRole};
use crate::config::LlmSettings;
use crate::error::Result;
use crate::llm::LlmProvider;
use crate::types::{CancelToken, Finding};

pub struct ManagerAgent {
    agent: Agent,
}

impl ManagerAgent {
    pub fn new(
        settings: LlmSettings,
        provider: Arc<dyn LlmProvider>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            agent: Agent::new(AgentRole::Manager, MANAGER_ROLE_PROMPT, settings, provider, cancel),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Issue a final verdict for a disputed finding given the verifier's
    /// analysis.
    pub async fn make_verdict(
        &self,
        finding: &Finding,
        verifier_result: &Value,
    ) -> Result<Value> {
        let prompt = format!(
            r#"## Disputed finding
- id: {id}
- title: {title}
- severity: {severity}
- description: {description}

## Verifier analysis
{verifier}

## Task
The verifier's conclusion is low-confidence or unresolved. Weigh the
technical analysis against the business impact and decide.

Output JSON:
```json
{{
  "final_verdict": "confirmed|false_positive",
  "confidence": 0,
  "final_severity": "critical|high|medium|low|none",
  "action_required": "what the project team should do",
  "reasoning": "one paragraph"
}}
```"#,
            id = finding.id,
            title = finding.title,
            severity = finding.severity,
            description = finding.description,
            verifier = serde_json::to_string_pretty(verifier_result).unwrap_or_default(),
        );

        let response = self.agent.call_llm(&prompt, None, true, true).await?;
        Ok(self
            .agent
            .parse_json_response(&response)
            .unwrap_or_else(|| {
                serde_json::json!({
                    "final_verdict": "confirmed",
                    "confidence": 60,
                    "reasoning": "parse_failed",
                })
            }))
    }
}
