//! Verifier agent - the single agent driving Phase 3
//!
//! Two verification shapes:
//! - `verify_group_with_tools`: one LLM call per group of findings from the
//!   same module, over a pre-built shared context and knowledge bundle.
//!   Returns one result per input; a missing entry yields a conservative
//!   `confirmed` (never a silent drop).
//! - `verify_finding`: the per-finding fallback used when group mode is
//!   disabled.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::prompts::{
    GROUP_VERIFICATION_OUTPUT, GROUP_VERIFICATION_STANDARDS, VERIFIER_ROLE_PROMPT,
    VERIFIER_VERIFICATION_PROMPT,
};
use super::{Agent, AgentRole};
use crate::config::LlmSettings;
use crate::error::Result;
use crate::llm::LlmProvider;
use crate::toolkit::AgentToolkit;
use crate::types::{CancelToken, Finding};

pub struct VerifierAgent {
    agent: Agent,
}

impl VerifierAgent {
    pub fn new(
        settings: LlmSettings,
        provider: Arc<dyn LlmProvider>,
        toolkit: Arc<AgentToolkit>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            agent: Agent::new(
                AgentRole::Verifier,
                VERIFIER_ROLE_PROMPT,
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

    /// Grouped verification: one call for up to `group_size` findings from
    /// the same module. `shared_context` and `group_knowledge` are built
    /// once per group by the pipeline.
    pub async fn verify_group_with_tools(
        &self,
        findings: &[Finding],
        shared_context: &str,
        group_knowledge: &str,
        function_index: &str,
        analysis_context: &str,
        max_tool_rounds: usize,
    ) -> Result<Vec<Value>> {
        if findings.is_empty() {
            return Ok(Vec::new());
        }

        let findings_text: Vec<String> = findings
            .iter()
            .enumerate()
            .map(|(i, finding)| render_finding(i + 1, finding))
            .collect();

        let knowledge_section = if group_knowledge.is_empty() {
            String::new()
        } else {
            format!("\n{group_knowledge}\n")
        };
        let index_section = if function_index.is_empty() {
            String::new()
        } else {
            format!("\n{function_index}\n")
        };
        let analysis_section = if analysis_context.is_empty() {
            String::new()
        } else {
            format!("\n{analysis_context}\n")
        };

        let context_block = if shared_context.is_empty() {
            "no pre-built context; fetch code with the tools".to_string()
        } else {
            shared_context.to_string()
        };

        let prompt = format!(
            r#"# Batch finding verification

You are verifying {count} findings from the same module. They share the
code context below.
{knowledge_section}
---

## Shared code context

```move
{context_block}
```
{index_section}{analysis_section}
---

## Findings under verification
{findings_block}

---

{standards}

## Tool usage

The shared context above usually suffices. Call tools only for
cross-module functions, type definitions or deeper call chains, at most
two per round.

{output}"#,
            count = findings.len(),
            findings_block = findings_text.join(""),
            standards = GROUP_VERIFICATION_STANDARDS,
            output = GROUP_VERIFICATION_OUTPUT,
        );

        let tools = self
            .agent
            .toolkit()
            .map(|tk| tk.security_tools())
            .unwrap_or_default();
        let response = self
            .agent
            .call_llm_with_tools(&prompt, &tools, max_tool_rounds, true)
            .await?;

        let parsed = self.agent.parse_json_response(&response);
        Ok(self.match_group_results(findings, parsed))
    }

    /// Map the model's result array back onto the inputs by `vuln_index`
    /// (1-based) or finding id; inputs without a match become conservative
    /// confirmed entries.
    fn match_group_results(&self, findings: &[Finding], parsed: Option<Value>) -> Vec<Value> {
        let results: Vec<Value> = parsed
            .as_ref()
            .and_then(|p| p.get("results"))
            .and_then(|r| r.as_array())
            .cloned()
            .or_else(|| parsed.as_ref().and_then(|p| p.as_array().cloned()))
            .unwrap_or_default();

        findings
            .iter()
            .enumerate()
            .map(|(i, finding)| {
                let matched = results.iter().find(|r| {
                    r.get("vuln_index")
                        .and_then(|v| v.as_u64())
                        .map(|v| v == (i + 1) as u64)
                        .unwrap_or(false)
                        || r.get("vuln_id")
                            .and_then(|v| v.as_str())
                            .map(|id| id == finding.id)
                            .unwrap_or(false)
                });
                match matched {
                    Some(result) => result.clone(),
                    None => {
                        warn!(finding = %finding.id, "group verification returned no entry, defaulting to confirmed");
                        json!({
                            "vuln_index": i + 1,
                            "vuln_id": finding.id,
                            "conclusion": "confirmed",
                            "confidence": 50,
                            "final_severity": finding.severity.as_str(),
                            "security_mechanism_covered": false,
                            "mechanism_name": "",
                            "reasoning": "group verification returned no result for this finding; kept conservatively",
                        })
                    }
                }
            })
            .collect()
    }

    /// Per-finding verification (fallback mode). `enhanced_knowledge` is
    /// the targeted knowledge + soft-filter hint block assembled by the
    /// pipeline; empty when nothing matched.
    pub async fn verify_finding(
        &self,
        finding: &Finding,
        code_context: &str,
        enhanced_knowledge: &str,
        function_index: &str,
        analysis_context: &str,
        max_tool_rounds: usize,
    ) -> Result<Value> {
        let knowledge_section = if enhanced_knowledge.is_empty() {
            String::new()
        } else {
            format!("{enhanced_knowledge}\n\n---\n\n")
        };
        let index_section = if function_index.is_empty() {
            String::new()
        } else {
            format!("\n## Queryable functions\n{function_index}\n")
        };
        let analysis_section = if analysis_context.is_empty() {
            String::new()
        } else {
            format!("\n{analysis_context}\n")
        };

        let prompt = format!(
            r#"{knowledge_section}## Finding
- id: {id}
- title: {title}
- severity: {severity}
- location: {location}
- description: {description}
- evidence: {evidence}

## Pre-built code context
```move
{context}
```

## Tool usage
{tool_note}
- Call tools only for cross-module functions, type definitions or deeper
  call chains; at most two per round.
{index_section}{analysis_section}
## Verification task
{task}"#,
            id = finding.id,
            title = finding.title,
            severity = finding.severity,
            location = finding.location.func_id(),
            description = finding.description,
            evidence = truncated(&finding.evidence, 800),
            context = if code_context.is_empty() {
                "no pre-built context; use the tools"
            } else {
                code_context
            },
            tool_note = if code_context.len() > 100 {
                "- The finding's function and call chain are already above; verify against them first."
            } else {
                "- Fetch the relevant code with the tools."
            },
            task = VERIFIER_VERIFICATION_PROMPT,
        );

        let tools = self
            .agent
            .toolkit()
            .map(|tk| tk.security_tools())
            .unwrap_or_default();
        let response = self
            .agent
            .call_llm_with_tools(&prompt, &tools, max_tool_rounds, true)
            .await?;

        debug!(finding = %finding.id, "per-finding verification answered");
        Ok(self.agent.parse_json_response(&response).unwrap_or_else(|| {
            // Ladder exhausted: the conservative default keeps the finding
            json!({
                "conclusion": "confirmed",
                "confidence": 50,
                "final_severity": finding.severity.as_str(),
                "reasoning": "parse_failed",
            })
        }))
    }
}

fn render_finding(index: usize, finding: &Finding) -> String {
    let soft_hint = finding
        .soft_filter_hint
        .as_ref()
        .map(|hint| {
            format!(
                "\n> Exclusion-rule hint [{}]: {}\n> {}\n> Verify carefully; when the protection or design choice holds, judge false_positive.",
                hint.rule_name, hint.reason, hint.hint_for_ai
            )
        })
        .unwrap_or_default();

    format!(
        "\n### Finding [{index}]: {id}\n- title: {title}\n- severity: {severity}\n- function: {function}\n- description: {description}\n- evidence: ```{evidence}```{soft_hint}\n",
        id = finding.id,
        title = finding.title,
        severity = finding.severity,
        function = finding.location.func_id(),
        description = finding.description,
        evidence = truncated(&finding.evidence, 800),
    )
}

fn truncated(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect::<String>() + "..."
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Location, Severity};

    fn finding(id: &str) -> Finding {
        Finding {
            id: id.into(),
            title: "test finding".into(),
            severity: Severity::High,
            category: "access_control".into(),
            location: Location::new("demo::pool", "withdraw"),
            description: "desc".into(),
            evidence: "code".into(),
            attack_scenario: None,
            recommendation: None,
            confidence: 70,
            phase2_context: None,
            phase2_func_context: None,
            module_name: None,
            soft_filter_hint: None,
        }
    }

    fn verifier() -> VerifierAgent {
        let dir = tempfile::tempdir().unwrap();
        let index = crate::indexer::ProjectIndex::build(dir.path(), false).unwrap();
        let toolkit = Arc::new(AgentToolkit::new(Arc::new(index)));
        let provider = crate::llm::create_provider(&LlmSettings::default()).unwrap();
        VerifierAgent::new(LlmSettings::default(), provider, toolkit, CancelToken::new())
    }

    #[test]
    fn group_results_match_by_index_and_id() {
        let v = verifier();
        let findings = vec![finding("V-1"), finding("V-2"), finding("V-3")];
        let parsed = serde_json::json!({
            "results": [
                {"vuln_index": 2, "conclusion": "false_positive", "confidence": 90},
                {"vuln_id": "V-1", "conclusion": "confirmed", "confidence": 80},
            ]
        });
        let matched = v.match_group_results(&findings, Some(parsed));
        assert_eq!(matched.len(), 3);
        assert_eq!(matched[0]["conclusion"], "confirmed");
        assert_eq!(matched[1]["conclusion"], "false_positive");
        // V-3 had no entry: conservative confirmed
        assert_eq!(matched[2]["conclusion"], "confirmed");
        assert_eq!(matched[2]["confidence"], 50);
    }

    #[test]
    fn unparsable_group_response_defaults_every_finding() {
        let v = verifier();
        let findings = vec![finding("V-1"), finding("V-2")];
        let matched = v.match_group_results(&findings, None);
        assert_eq!(matched.len(), 2);
        for entry in matched {
            assert_eq!(entry["conclusion"], "confirmed");
        }
    }

    #[test]
    fn soft_filter_hint_is_rendered_into_prompt() {
        let mut f = finding("V-9");
        f.soft_filter_hint = Some(crate::types::SoftFilterHint {
            rule_name: "capability_parameter".into(),
            reason: "a capability parameter enforces authorisation".into(),
            hint_for_ai: "check the parameter list".into(),
        });
        let text = render_finding(1, &f);
        assert!(text.contains("capability_parameter"));
        assert!(text.contains("Exclusion-rule hint"));
    }
}
