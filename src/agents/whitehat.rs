//! WhiteHat agent - Phase 4 exploit-chain analysis
//!
//! Runs only against HIGH/CRITICAL confirmed findings. Each analysis goes
//! through an isolated sub-agent (fresh provider, fresh messages, short
//! tool loop) so concurrent analyses never serialise on a shared lock; the
//! sub-agent's token usage is merged back into this agent's counters.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::prompts::{WHITEHAT_ROLE_PROMPT, WHITEHAT_VERIFICATION_PROMPT};
use super::{Agent, AgentRole};
use crate::config::LlmSettings;
use crate::error::Result;
use crate::json_repair::WHITEHAT_FIELDS;
use crate::llm::LlmProvider;
use crate::toolkit::AgentToolkit;
use crate::types::{
    AttackStep, CancelToken, EntryPoint, ExploitImpact, ExploitStatus, ExploitVerificationReport,
    Precondition, VerifiedFinding,
};

/// Sub-agent round budget; the retrieval context is pre-built so a short
/// loop suffices
const SUB_AGENT_MAX_ROUNDS: usize = 5;

pub struct WhiteHatAgent {
    agent: Agent,
}

impl WhiteHatAgent {
    pub fn new(
        settings: LlmSettings,
        provider: Arc<dyn LlmProvider>,
        toolkit: Arc<AgentToolkit>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            agent: Agent::new(
                AgentRole::WhiteHat,
                WHITEHAT_ROLE_PROMPT,
                settings,
                provider,
                cancel,
            )
            .with_toolkit(toolkit),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Override how sub-agent providers are constructed (gateways, tests)
    pub fn with_sub_provider_factory(mut self, factory: crate::llm::ProviderFactory) -> Self {
        self.agent = self.agent.with_sub_provider_factory(factory);
        self
    }

    /// Analyse one confirmed finding for exploitability.
    /// `code_context` is the retrieval context (target function + callers
    /// + callees + purpose + hints) assembled by the engine.
    pub async fn analyze_exploit_chain(
        &self,
        verified: &VerifiedFinding,
        code_context: &str,
        function_index: &str,
    ) -> Result<ExploitVerificationReport> {
        let finding = &verified.original_finding;
        debug!(finding = %finding.id, "exploit-chain analysis");

        let system_prompt = format!(
            "{WHITEHAT_ROLE_PROMPT}\n\nWorking rules:\n\
- Analyse the provided code directly; use tools sparingly.\n\
- At most two tool calls per round.\n\
- Output the JSON result as soon as the chain is resolved either way.\n\n\
{WHITEHAT_VERIFICATION_PROMPT}"
        );

        let index_section = if function_index.is_empty() {
            String::new()
        } else {
            format!(
                "\n## Queryable functions\n{}\n",
                truncate_chars(function_index, 1500)
            )
        };

        let user_prompt = format!(
            r#"## Finding
- id: {id}
- title: {title}
- severity: {severity}
- location: {location}
- description: {description}
- verifier reasoning: {verifier_reasoning}

## Code context
```move
{context}
```
{index_section}
Determine exploitability and output the JSON result."#,
            id = finding.id,
            title = finding.title,
            severity = verified.final_severity,
            location = finding.location.func_id(),
            description = truncate_chars(&finding.description, 500),
            verifier_reasoning = verified
                .verifier_result
                .get("reasoning")
                .and_then(|v| v.as_str())
                .unwrap_or(""),
            context = truncate_chars(code_context, 6000),
        );

        let parsed = self
            .agent
            .verify_lightweight(
                &system_prompt,
                &user_prompt,
                SUB_AGENT_MAX_ROUNDS,
                WHITEHAT_FIELDS,
            )
            .await?;

        Ok(report_from_parsed(verified, &parsed))
    }
}

/// Map confidence strings ("high"/"medium"/"low"/"theoretical") or numbers
/// to a 0-100 score
fn confidence_score(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(50.0),
        Some(Value::String(s)) => match s.to_lowercase().as_str() {
            "high" => 85.0,
            "medium" => 60.0,
            "low" => 35.0,
            "theoretical" => 15.0,
            other => other.parse().unwrap_or(50.0),
        },
        _ => 50.0,
    }
}

/// Status derivation from (is_exploitable, confidence, score):
/// (true, >=80, >=7) verified; (true, >=60, >=5) likely;
/// (false, >=80, <=2) false_positive; (false, >=80, >2) theoretical;
/// otherwise needs_review.
pub fn determine_status(is_exploitable: bool, confidence: f64, score: f64) -> ExploitStatus {
    if is_exploitable {
        if confidence >= 80.0 && score >= 7.0 {
            ExploitStatus::Verified
        } else if confidence >= 60.0 && score >= 5.0 {
            ExploitStatus::Likely
        } else {
            ExploitStatus::NeedsReview
        }
    } else if confidence >= 80.0 {
        if score <= 2.0 {
            ExploitStatus::FalsePositive
        } else {
            ExploitStatus::Theoretical
        }
    } else {
        ExploitStatus::NeedsReview
    }
}

fn report_from_parsed(verified: &VerifiedFinding, parsed: &Value) -> ExploitVerificationReport {
    let finding = &verified.original_finding;

    if parsed.get("error").is_some() {
        warn!(finding = %finding.id, "exploit analysis unparsable, conservative report");
    }

    let is_exploitable = parsed
        .get("is_exploitable")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let confidence = confidence_score(parsed.get("confidence"));
    let score = parsed
        .get("exploitability_score")
        .and_then(|v| v.as_f64())
        .unwrap_or(if is_exploitable { 5.0 } else { 3.0 });
    let status = determine_status(is_exploitable, confidence, score);

    let attack_path: Vec<AttackStep> = parsed
        .get("attack_path")
        .and_then(|v| v.as_array())
        .map(|steps| {
            steps
                .iter()
                .filter_map(|s| serde_json::from_value(s.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    let preconditions: Vec<Precondition> = parsed
        .get("preconditions")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|s| serde_json::from_value(s.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    let entry_point: Option<EntryPoint> = parsed
        .get("entry_point")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let impact: Option<ExploitImpact> = parsed
        .get("impact")
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    let text = |key: &str| {
        parsed
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };

    ExploitVerificationReport {
        vulnerability_id: finding.id.clone(),
        vulnerability_type: finding.category.clone(),
        severity: verified.final_severity,
        status,
        confidence_score: confidence,
        exploitability_score: score,
        vulnerability_summary: text("vulnerability_summary"),
        entry_point,
        attack_path,
        preconditions,
        impact,
        poc_code: unescape_code(&text("poc_code")),
        one_liner_exploit: text("one_liner_exploit"),
        why_exploitable: text("why_exploitable"),
        why_not_exploitable: {
            let reason = text("why_not_exploitable");
            (!reason.is_empty()).then_some(reason)
        },
        similar_cases: parsed
            .get("similar_cases")
            .and_then(|v| v.as_array())
            .map(|cases| {
                cases
                    .iter()
                    .filter_map(|c| c.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
        analysis_reasoning: text("exploit_reasoning"),
    }
}

/// Undo JSON string escaping in PoC code blocks
fn unescape_code(code: &str) -> String {
    code.replace("\\n", "\n")
        .replace("\\t", "    ")
        .replace("\\\"", "\"")
        .trim()
        .to_string()
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

    #[test]
    fn status_derivation_table() {
        assert_eq!(determine_status(true, 85.0, 8.0), ExploitStatus::Verified);
        assert_eq!(determine_status(true, 65.0, 5.0), ExploitStatus::Likely);
        assert_eq!(determine_status(true, 30.0, 4.0), ExploitStatus::NeedsReview);
        assert_eq!(determine_status(true, 90.0, 3.0), ExploitStatus::NeedsReview);
        assert_eq!(determine_status(false, 85.0, 1.0), ExploitStatus::FalsePositive);
        assert_eq!(determine_status(false, 85.0, 4.0), ExploitStatus::Theoretical);
        assert_eq!(determine_status(false, 40.0, 1.0), ExploitStatus::NeedsReview);
    }

    #[test]
    fn confidence_strings_map_to_scores() {
        assert_eq!(confidence_score(Some(&serde_json::json!("high"))), 85.0);
        assert_eq!(confidence_score(Some(&serde_json::json!("theoretical"))), 15.0);
        assert_eq!(confidence_score(Some(&serde_json::json!(72))), 72.0);
        assert_eq!(confidence_score(None), 50.0);
    }

    #[test]
    fn poc_code_is_unescaped() {
        assert_eq!(
            unescape_code("module x {\\n\\tfun f() {}\\n}"),
            "module x {\n    fun f() {}\n}"
        );
    }
}
