//! Auditor agent - Phase 2 raw vulnerability scanning
//!
//! Three scan modes:
//! - batched function analysis (primary): N functions per LLM call, each
//!   with its type definitions and callee implementations - the context
//!   that makes cross-function logic bugs visible
//! - broad analysis: one pass over a module, all vulnerability categories
//! - targeted analysis: one vulnerability type per call
//!
//! All calls are stateless so batches parallelise on a shared instance.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{prompts::AUDITOR_ROLE_PROMPT, Agent, AgentRole};
use crate::config::LlmSettings;
use crate::error::Result;
use crate::llm::LlmProvider;
use crate::toolkit::AgentToolkit;
use crate::types::{CancelToken, Finding, Severity};

/// Per-function context assembled by the engine for one batch entry
#[derive(Debug, Clone, Default)]
pub struct FunctionScanContext {
    pub module_name: String,
    pub function_name: String,
    pub signature: String,
    pub visibility: String,
    pub function_code: String,
    pub risk_score: u32,
    pub callers: Vec<String>,
    pub callees: Vec<String>,
    /// Struct definitions referenced by the function
    pub type_definitions: String,
    /// Bodies of one-hop callees
    pub callee_implementations: String,
}

impl FunctionScanContext {
    pub fn func_id(&self) -> String {
        format!("{}::{}", self.module_name, self.function_name)
    }
}

/// Outcome of one batch scan
#[derive(Debug, Default)]
pub struct BatchScanResult {
    /// Findings keyed to their function, flattened in input order
    pub findings: Vec<Finding>,
    /// Cross-function issues spanning several functions of the batch
    pub cross_function_issues: Vec<Finding>,
    pub safe_functions: Vec<String>,
}

pub struct AuditorAgent {
    agent: Agent,
}

impl AuditorAgent {
    pub fn new(
        settings: LlmSettings,
        provider: Arc<dyn LlmProvider>,
        toolkit: Arc<AgentToolkit>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            agent: Agent::new(AgentRole::Auditor, AUDITOR_ROLE_PROMPT, settings, provider, cancel)
                .with_toolkit(toolkit),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Batched function analysis: one LLM call over `contexts`
    pub async fn analyze_functions_batch(
        &self,
        contexts: &[FunctionScanContext],
        batch_id: usize,
    ) -> Result<BatchScanResult> {
        if contexts.is_empty() {
            return Ok(BatchScanResult::default());
        }

        let mut type_definitions: Vec<&str> = Vec::new();
        let mut callee_impls: Vec<&str> = Vec::new();
        let mut functions_text = Vec::new();

        for (i, ctx) in contexts.iter().enumerate() {
            if !ctx.type_definitions.is_empty()
                && !type_definitions.contains(&ctx.type_definitions.as_str())
            {
                type_definitions.push(&ctx.type_definitions);
            }
            if !ctx.callee_implementations.is_empty()
                && !callee_impls.contains(&ctx.callee_implementations.as_str())
            {
                callee_impls.push(&ctx.callee_implementations);
            }

            let caller_note = if ctx.callers.is_empty() {
                "entry function (no internal callers)".to_string()
            } else {
                format!("called by: {}", ctx.callers.join(", "))
            };
            let callee_note = if ctx.callees.is_empty() {
                String::new()
            } else {
                format!(" | calls: {}", ctx.callees.join(", "))
            };
            functions_text.push(format!(
                "\n### [{index}] {id}\n- signature: `{signature}`\n- visibility: `{visibility}` | risk score: {risk}\n- {caller_note}{callee_note}\n\n```move\n{code}\n```\n",
                index = i + 1,
                id = ctx.func_id(),
                signature = ctx.signature,
                visibility = ctx.visibility,
                risk = ctx.risk_score,
                code = ctx.function_code,
            ));
        }

        let type_section = if type_definitions.is_empty() {
            String::new()
        } else {
            format!(
                "\n## Relevant type definitions (check these for type-confusion bugs)\n```move\n{}\n```\n",
                type_definitions.join("\n")
            )
        };
        let callee_section = if callee_impls.is_empty() {
            String::new()
        } else {
            format!(
                "\n## Callee implementations (needed to follow cross-function logic)\n```move\n{}\n```\n",
                callee_impls.join("\n")
            )
        };

        let first_id = contexts[0].func_id();
        let prompt = format!(
            r#"## Task
Audit the following {count} Move functions in one pass. The functions may
call each other: look for cross-function vulnerability chains, not just
per-function issues.
{type_section}{callee_section}
## Functions
{functions}

## Checklist (apply to every function)

### 1. Access control
- Does a public function need a capability check it does not have?
- Before reporting, check the caller list: wrappers demanding a
  capability already protect their callees.

### 2. Arithmetic
- Bit shifts (<<, >>) on values an attacker influences.
- Casts that truncate after widening arithmetic.

### 3. Resource handling
- Coin/Balance splits and joins that lose or double-count funds.
- Receipts or positions whose abilities undermine intended linearity.

### 4. Cross-function analysis (the important one)
- Does function A's output weaken function B's checks?
- Do generic type parameters flow between functions without equality
  checks?

## Output format
```json
{{
  "batch_id": {batch_id},
  "results": {{
    "{first_id}": [
      {{
        "id": "BATCH-{batch_id}-001",
        "title": "",
        "severity": "critical|high|medium|low",
        "category": "access_control|overflow|resource|logic|type_confusion|flashloan",
        "location": {{"module": "", "function": "", "code_snippet": ""}},
        "description": "",
        "proof": "code copied verbatim from the source",
        "attack_scenario": "",
        "recommendation": "",
        "confidence": 0
      }}
    ]
  }},
  "cross_function_issues": [
    {{
      "id": "CHAIN-{batch_id}-001",
      "title": "",
      "severity": "high",
      "category": "logic",
      "involved_functions": [],
      "attack_flow": "step -> step -> impact",
      "description": ""
    }}
  ],
  "safe_functions": ["functions with no findings"]
}}
```
List clean functions in safe_functions instead of emitting empty arrays."#,
            count = contexts.len(),
            functions = functions_text.join(""),
        );

        let response = self.agent.call_llm(&prompt, None, true, true).await?;
        let parsed = self
            .agent
            .parse_json_response(&response)
            .unwrap_or_else(|| serde_json::json!({}));
        Ok(self.collect_batch_result(&parsed, contexts, batch_id))
    }

    fn collect_batch_result(
        &self,
        parsed: &Value,
        contexts: &[FunctionScanContext],
        batch_id: usize,
    ) -> BatchScanResult {
        let mut result = BatchScanResult::default();
        let mut counter = 0usize;

        if let Some(results) = parsed.get("results").and_then(|r| r.as_object()) {
            // Preserve batch input order, not the model's key order
            for ctx in contexts {
                let func_id = ctx.func_id();
                let entries = results
                    .get(&func_id)
                    .or_else(|| results.get(&ctx.function_name))
                    .and_then(|v| v.as_array());
                let Some(entries) = entries else { continue };
                for entry in entries {
                    counter += 1;
                    if let Some(finding) =
                        finding_from_value(entry, &ctx.module_name, &ctx.function_name, batch_id, counter)
                    {
                        result.findings.push(finding);
                    }
                }
            }
        }

        if let Some(chains) = parsed.get("cross_function_issues").and_then(|v| v.as_array()) {
            for (i, entry) in chains.iter().enumerate() {
                let module = contexts
                    .first()
                    .map(|c| c.module_name.clone())
                    .unwrap_or_default();
                let mut finding = match finding_from_value(entry, &module, "", batch_id, i + 1) {
                    Some(f) => f,
                    None => continue,
                };
                if finding.id.is_empty() {
                    finding.id = format!("CHAIN-{batch_id}-{:03}", i + 1);
                }
                // attack_flow is the chain's evidence when proof is absent
                if finding.evidence.is_empty() {
                    if let Some(flow) = entry.get("attack_flow").and_then(|v| v.as_str()) {
                        finding.evidence = flow.to_string();
                    }
                }
                result.cross_function_issues.push(finding);
            }
        }

        if let Some(safe) = parsed.get("safe_functions").and_then(|v| v.as_array()) {
            result.safe_functions = safe
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }

        debug!(
            batch_id,
            findings = result.findings.len(),
            chains = result.cross_function_issues.len(),
            "batch scan parsed"
        );
        result
    }

    /// Broad analysis: one pass over module source, all categories at once
    pub async fn broad_analysis(&self, module_name: &str, code: &str) -> Result<Vec<Finding>> {
        let prompt = format!(
            r#"## Task
Run a broad security audit over this Move module. Survey every
vulnerability category: access control, arithmetic (shifts!), resource
handling, type confusion, flash-loan safety, logic errors.

## Module {module_name}
```move
{code}
```

## Output format
```json
{{
  "findings": [
    {{
      "id": "BA-001",
      "title": "",
      "severity": "critical|high|medium|low",
      "category": "",
      "location": {{"module": "{module_name}", "function": "", "code_snippet": ""}},
      "description": "",
      "proof": "code copied verbatim",
      "recommendation": "",
      "confidence": 0
    }}
  ]
}}
```
Report nothing speculative: every finding needs verbatim code evidence."#,
        );
        let response = self.agent.call_llm(&prompt, None, true, true).await?;
        Ok(self.parse_findings_array(&response, module_name, "BA"))
    }

    /// Targeted analysis: one vulnerability type per call
    pub async fn targeted_analysis(
        &self,
        module_name: &str,
        code: &str,
        vuln_type: &str,
    ) -> Result<Vec<Finding>> {
        let focus = vuln_detection_focus(vuln_type);
        let prompt = format!(
            r#"## Task
Audit this Move module for exactly one vulnerability class: {vuln_type}.

{focus}

## Module {module_name}
```move
{code}
```

## Output format
```json
{{
  "findings": [
    {{
      "id": "TA-001",
      "title": "",
      "severity": "critical|high|medium|low",
      "category": "{vuln_type}",
      "location": {{"module": "{module_name}", "function": "", "code_snippet": ""}},
      "description": "",
      "proof": "code copied verbatim",
      "recommendation": "",
      "confidence": 0
    }}
  ]
}}
```
An empty findings array is the correct output when the class is absent."#,
        );
        let response = self.agent.call_llm(&prompt, None, true, true).await?;
        Ok(self.parse_findings_array(&response, module_name, "TA"))
    }

    fn parse_findings_array(&self, response: &str, module_name: &str, prefix: &str) -> Vec<Finding> {
        let Some(parsed) = self.agent.parse_json_response(response) else {
            warn!(module = module_name, "scan response unparsable, no findings collected");
            return Vec::new();
        };
        let entries = parsed
            .get("findings")
            .and_then(|v| v.as_array())
            .cloned()
            .or_else(|| parsed.as_array().cloned())
            .unwrap_or_default();
        entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| {
                finding_from_value(entry, module_name, "", 0, i + 1).map(|mut finding| {
                    if finding.id.is_empty() {
                        finding.id = format!("{prefix}-{:03}", i + 1);
                    }
                    finding
                })
            })
            .collect()
    }
}

/// Convert one LLM finding object into a `Finding`, filling location
/// defaults from the scan context
fn finding_from_value(
    entry: &Value,
    default_module: &str,
    default_function: &str,
    batch_id: usize,
    counter: usize,
) -> Option<Finding> {
    let obj = entry.as_object()?;
    let mut finding: Finding = serde_json::from_value(entry.clone()).ok().or_else(|| {
        // Tolerate shape drift: rebuild from individual fields
        Some(Finding {
            id: obj.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            title: obj.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            severity: obj
                .get("severity")
                .and_then(|v| v.as_str())
                .map(Severity::parse_lenient)
                .unwrap_or_default(),
            category: obj.get("category").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            location: obj
                .get("location")
                .and_then(|l| serde_json::from_value(l.clone()).ok())
                .unwrap_or_default(),
            description: obj
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            evidence: obj
                .get("proof")
                .or_else(|| obj.get("evidence"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            attack_scenario: obj
                .get("attack_scenario")
                .and_then(|v| v.as_str())
                .map(String::from),
            recommendation: obj
                .get("recommendation")
                .and_then(|v| v.as_str())
                .map(String::from),
            confidence: obj.get("confidence").and_then(|v| v.as_u64()).unwrap_or(50) as u8,
            phase2_context: None,
            phase2_func_context: None,
            module_name: None,
            soft_filter_hint: None,
        })
    })?;

    if finding.title.is_empty() {
        return None;
    }
    if finding.id.is_empty() {
        finding.id = format!("BATCH-{batch_id}-{counter:03}");
    }
    if finding.location.module.is_empty() {
        finding.location.module = default_module.to_string();
    }
    if finding.location.function.is_empty() && !default_function.is_empty() {
        finding.location.function = default_function.to_string();
    }
    Some(finding)
}

fn vuln_detection_focus(vuln_type: &str) -> &'static str {
    match vuln_type {
        "access_control" => "Look for public/entry functions mutating privileged state without a \
capability parameter on any layer. Read caller signatures before reporting.",
        "overflow" => "The VM aborts on +,-,*,/ overflow; focus exclusively on bit shifts and \
narrowing casts, which are unprotected.",
        "flashloan" => "Check the receipt struct's abilities (drop breaks enforcement) and the \
repay function's type-equality, amount and pool-id assertions.",
        "type_confusion" => "Follow every generic type parameter: is the concrete type compared \
for equality where assets are returned or matched? Membership checks are not equality.",
        _ => "Apply the class's standard detection patterns rigorously; demand verbatim evidence.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finding_from_value_fills_defaults() {
        let entry = serde_json::json!({
            "title": "Missing check",
            "severity": "high",
            "proof": "fun f() {}",
        });
        let finding = finding_from_value(&entry, "demo::pool", "withdraw", 2, 7).unwrap();
        assert_eq!(finding.id, "BATCH-2-007");
        assert_eq!(finding.location.module, "demo::pool");
        assert_eq!(finding.location.function, "withdraw");
        assert_eq!(finding.evidence, "fun f() {}");
        assert_eq!(finding.severity, Severity::High);
    }

    #[test]
    fn untitled_entries_are_dropped() {
        let entry = serde_json::json!({"severity": "low"});
        assert!(finding_from_value(&entry, "m", "f", 0, 1).is_none());
    }
}
