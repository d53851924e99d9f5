//! Role-swap verification pipeline (Phase 3)
//!
//! Steps:
//! 1. Soft filtering: exclusion rules annotate findings, never drop them.
//! 2. Function-code retrieval per finding: Phase-2 context first, then the
//!    toolkit, then the finding's own evidence (hit path counted).
//! 3. Module grouping, then chunks of `group_size` per verification group.
//! 4. Per group, built exactly once: a shared code context (bodies +
//!    one-hop callees + caller signatures - the caller signatures are the
//!    key signal for the layered-design pattern) and a deduplicated
//!    knowledge bundle.
//! 5. One verifier call per group under a semaphore; conservative
//!    normalisation of the verdicts.
//!
//! Output preserves input order and contains exactly one VerifiedFinding
//! per input; a failed group yields needs_review entries, never a drop.

use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::agents::verifier::VerifierAgent;
use crate::config::AuditConfig;
use crate::error::Result;
use crate::knowledge;
use crate::toolkit::AgentToolkit;
use crate::types::{
    CancelToken, Finding, Severity, SwapRound, VerificationStatus, VerifiedFinding,
};

/// Where each finding's function code came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub from_phase2: usize,
    pub from_toolkit: usize,
    pub from_evidence: usize,
}

/// The Phase 3 driver
pub struct RoleSwapVerifier {
    verifier: Arc<VerifierAgent>,
    toolkit: Arc<AgentToolkit>,
    group_size: usize,
    max_concurrent: usize,
    batch_cooldown: Duration,
    use_group_verify: bool,
    cancel: CancelToken,
}

impl RoleSwapVerifier {
    pub fn new(
        verifier: Arc<VerifierAgent>,
        toolkit: Arc<AgentToolkit>,
        config: &AuditConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            verifier,
            toolkit,
            group_size: config.group_size.max(1),
            max_concurrent: config.concurrency.max_concurrent_verify.max(1),
            batch_cooldown: Duration::from_secs_f64(config.concurrency.batch_cooldown_secs),
            use_group_verify: config.use_group_verify,
            cancel,
        }
    }

    /// Verify all raw findings. Returns one VerifiedFinding per input, in
    /// input order, plus the retrieval-path statistics.
    pub async fn batch_verify(
        &self,
        findings: Vec<Finding>,
    ) -> Result<(Vec<VerifiedFinding>, ContextStats)> {
        if findings.is_empty() {
            return Ok((Vec::new(), ContextStats::default()));
        }
        let total = findings.len();

        // Step 1: soft filtering (annotates, never drops)
        let findings = crate::rules::apply_exclusion_rules(findings);
        debug_assert_eq!(findings.len(), total);

        // Step 2: per-finding function code + caller signatures
        let mut stats = ContextStats::default();
        let codes: Vec<String> = findings
            .iter()
            .map(|finding| self.fetch_function_code(finding, &mut stats))
            .collect();
        info!(
            total,
            phase2 = stats.from_phase2,
            toolkit = stats.from_toolkit,
            evidence = stats.from_evidence,
            "function code retrieval"
        );

        let verified = if self.use_group_verify {
            self.verify_grouped(&findings, &codes).await?
        } else {
            self.verify_per_finding(&findings).await?
        };

        debug_assert_eq!(verified.len(), total);
        let confirmed = verified
            .iter()
            .filter(|v| v.verification_status == VerificationStatus::Confirmed)
            .count();
        let false_positives = verified
            .iter()
            .filter(|v| v.verification_status == VerificationStatus::FalsePositive)
            .count();
        info!(total, confirmed, false_positives, "verification complete");

        Ok((verified, stats))
    }

    // ------------------------------------------------------------------
    // Grouped mode
    // ------------------------------------------------------------------

    async fn verify_grouped(
        &self,
        findings: &[Finding],
        codes: &[String],
    ) -> Result<Vec<VerifiedFinding>> {
        let groups = group_findings(findings, self.group_size);
        info!(
            findings = findings.len(),
            groups = groups.len(),
            group_size = self.group_size,
            "grouped verification"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let tasks = groups.iter().enumerate().map(|(group_idx, group)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                if self.cancel.is_cancelled() {
                    return (group_idx, Err(crate::error::AuditError::Cancelled));
                }
                let outcome = self.verify_one_group(group, codes).await;
                // pace the provider while still holding the permit
                if !self.batch_cooldown.is_zero() {
                    tokio::time::sleep(self.batch_cooldown).await;
                }
                (group_idx, outcome)
            }
        });

        // Collect by original index, not completion order
        let mut slots: Vec<Option<VerifiedFinding>> = vec![None; findings.len()];
        let mut cancelled = false;
        for (group_idx, outcome) in join_all(tasks).await {
            let group = &groups[group_idx];
            match outcome {
                Ok(results) => {
                    for ((original_idx, _), verified) in group.iter().zip(results) {
                        slots[*original_idx] = Some(verified);
                    }
                }
                Err(e) if e.is_cancelled() => {
                    cancelled = true;
                    for (original_idx, finding) in group {
                        slots[*original_idx] =
                            Some(VerifiedFinding::from_error((*finding).clone(), "cancelled"));
                    }
                }
                Err(e) => {
                    warn!(group = group_idx, error = %e, "group verification failed");
                    let message = format!("error: {e}");
                    for (original_idx, finding) in group {
                        slots[*original_idx] =
                            Some(VerifiedFinding::from_error((*finding).clone(), &message));
                    }
                }
            }
        }
        if cancelled {
            return Err(crate::error::AuditError::Cancelled);
        }

        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    VerifiedFinding::from_error(findings[i].clone(), "no group result")
                })
            })
            .collect())
    }

    async fn verify_one_group(
        &self,
        group: &[(usize, &Finding)],
        codes: &[String],
    ) -> Result<Vec<VerifiedFinding>> {
        let module = group
            .first()
            .map(|(_, f)| f.group_module())
            .unwrap_or_default();
        debug!(module = %module, findings = group.len(), "verifying group");

        let shared_context = self.build_group_context(group, codes);
        let group_knowledge = collect_group_knowledge(group);
        let function_index = self.toolkit.function_index(100);
        let analysis_context = self.toolkit.analysis_context();

        let group_findings: Vec<Finding> = group.iter().map(|(_, f)| (*f).clone()).collect();
        let results = self
            .verifier
            .verify_group_with_tools(
                &group_findings,
                &shared_context,
                &group_knowledge,
                &function_index,
                &analysis_context,
                3, // context is pre-built; three rounds suffice
            )
            .await?;

        Ok(group_findings
            .into_iter()
            .zip(results)
            .map(|(finding, result)| normalise_verdict(finding, result, &shared_context))
            .collect())
    }

    /// Shared code context: the union of the group's function bodies, a
    /// sample of one-hop callees, and the caller signatures saved by
    /// Phase 2 (layered-design evidence).
    fn build_group_context(&self, group: &[(usize, &Finding)], codes: &[String]) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut seen_functions: Vec<String> = Vec::new();

        for (original_idx, finding) in group {
            let func_id = finding.location.func_id();
            if seen_functions.contains(&func_id) {
                continue;
            }
            seen_functions.push(func_id.clone());

            let code = &codes[*original_idx];
            if !code.is_empty() {
                parts.push(format!("### {func_id}\n```move\n{code}\n```"));
            }
        }

        // One-hop callees for the first functions of the group
        for (_, finding) in group.iter().take(2) {
            let module = finding.group_module();
            let function = &finding.location.function;
            if function.is_empty() {
                continue;
            }
            let result = self.toolkit.call_tool(
                "get_callees",
                &serde_json::json!({ "module": module, "function": function, "depth": 1 }),
                "role_swap",
            );
            if result.success {
                if let Some(callees) = result.data.get("callees").and_then(|v| v.as_array()) {
                    let names: Vec<&str> = callees
                        .iter()
                        .take(3)
                        .filter_map(|c| c.get("id").and_then(|v| v.as_str()))
                        .collect();
                    if !names.is_empty() {
                        parts.push(format!("// {function} calls: {}", names.join(", ")));
                    }
                }
            }
        }

        // Caller signatures: the key signal for layered designs
        let mut caller_parts = Vec::new();
        for (_, finding) in group {
            if let Some(snapshot) = &finding.phase2_func_context {
                if !snapshot.caller_signatures.is_empty() {
                    caller_parts.push(format!(
                        "// {} is called by (check for layered protection!):\n{}",
                        finding.location.function,
                        snapshot
                            .caller_signatures
                            .iter()
                            .take(3)
                            .map(|sig| format!("//   {sig}"))
                            .collect::<Vec<_>>()
                            .join("\n")
                    ));
                }
            }
        }
        if !caller_parts.is_empty() {
            parts.push(format!(
                "### Caller signatures (layered-design evidence)\n{}",
                caller_parts.join("\n")
            ));
        }

        parts.join("\n\n")
    }

    // ------------------------------------------------------------------
    // Per-finding fallback mode
    // ------------------------------------------------------------------

    async fn verify_per_finding(&self, findings: &[Finding]) -> Result<Vec<VerifiedFinding>> {
        info!(findings = findings.len(), "per-finding verification");
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        let tasks = findings.iter().enumerate().map(|(idx, finding)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                if self.cancel.is_cancelled() {
                    return (idx, Err(crate::error::AuditError::Cancelled));
                }
                (idx, self.verify_single(finding).await)
            }
        });

        let mut slots: Vec<Option<VerifiedFinding>> = vec![None; findings.len()];
        let mut cancelled = false;
        for (idx, outcome) in join_all(tasks).await {
            slots[idx] = Some(match outcome {
                Ok(verified) => verified,
                Err(e) if e.is_cancelled() => {
                    cancelled = true;
                    VerifiedFinding::from_error(findings[idx].clone(), "cancelled")
                }
                Err(e) => VerifiedFinding::from_error(findings[idx].clone(), &format!("error: {e}")),
            });
        }
        if cancelled {
            return Err(crate::error::AuditError::Cancelled);
        }

        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| VerifiedFinding::from_error(findings[i].clone(), "missing"))
            })
            .collect())
    }

    async fn verify_single(&self, finding: &Finding) -> Result<VerifiedFinding> {
        let mut stats = ContextStats::default();
        let code_context = self.ensure_code_context(finding, &mut stats);

        // Targeted knowledge + pre-judgment hints for this one finding
        let mut knowledge_parts = Vec::new();
        let matched = knowledge::relevant_knowledge(finding);
        if !matched.is_empty() {
            knowledge_parts.push(format!("## Targeted security knowledge\n{matched}"));
        }
        if let Some(hint) = &finding.soft_filter_hint {
            knowledge_parts.push(format!(
                "## Exclusion-rule hint [{}]\n{}\n{}",
                hint.rule_name, hint.reason, hint.hint_for_ai
            ));
        } else if let Some(reason) =
            knowledge::is_likely_false_positive(&finding.category, &finding.description)
        {
            knowledge_parts.push(format!(
                "## Pre-judgment hint\nThis finding class is often a false positive: {reason}"
            ));
        }

        let result = self
            .verifier
            .verify_finding(
                finding,
                &code_context,
                &knowledge_parts.join("\n\n"),
                &self.toolkit.function_index(100),
                &self.toolkit.analysis_context(),
                3,
            )
            .await?;

        Ok(normalise_verdict(finding.clone(), result, &code_context))
    }

    // ------------------------------------------------------------------
    // Code retrieval
    // ------------------------------------------------------------------

    /// Function code for one finding: Phase-2 snapshot, else toolkit, else
    /// the finding's evidence. Updates the hit counters.
    fn fetch_function_code(&self, finding: &Finding, stats: &mut ContextStats) -> String {
        if let Some(snapshot) = &finding.phase2_func_context {
            if !snapshot.function_code.is_empty() {
                stats.from_phase2 += 1;
                return snapshot.function_code.clone();
            }
        }

        let function = &finding.location.function;
        if !function.is_empty() {
            let result = self.toolkit.call_tool(
                "get_function_code",
                &serde_json::json!({
                    "module": finding.group_module(),
                    "function": function,
                }),
                "role_swap",
            );
            if result.success {
                if let Some(body) = result.data.get("body").and_then(|v| v.as_str()) {
                    if !body.is_empty() {
                        stats.from_toolkit += 1;
                        return body.to_string();
                    }
                }
            }
        }

        if !finding.evidence.trim().is_empty() {
            stats.from_evidence += 1;
            return finding.evidence.clone();
        }
        String::new()
    }

    /// Richer single-finding context for the fallback mode: Phase-2 context
    /// string, else toolkit extraction, else evidence, else a minimal stub
    /// telling the model to use tools.
    fn ensure_code_context(&self, finding: &Finding, stats: &mut ContextStats) -> String {
        const MIN_CONTEXT: usize = 50;

        if let Some(ctx) = &finding.phase2_context {
            if ctx.trim().len() >= MIN_CONTEXT {
                stats.from_phase2 += 1;
                return ctx.clone();
            }
        }

        let function = extract_function_name(finding);
        if !function.is_empty() {
            let module = finding.group_module();
            let mut parts = Vec::new();
            let code = self.toolkit.call_tool(
                "get_function_code",
                &serde_json::json!({ "module": module, "function": function }),
                "role_swap",
            );
            if code.success {
                if let Some(body) = code.data.get("body").and_then(|v| v.as_str()) {
                    parts.push(format!("// target: {module}::{function}\n{body}"));
                }
            }
            for (tool, label) in [("get_callers", "callers"), ("get_callees", "calls")] {
                let result = self.toolkit.call_tool(
                    tool,
                    &serde_json::json!({ "module": module, "function": function, "depth": 1 }),
                    "role_swap",
                );
                if result.success {
                    let key = if tool == "get_callers" { "callers" } else { "callees" };
                    if let Some(items) = result.data.get(key).and_then(|v| v.as_array()) {
                        let names: Vec<&str> = items
                            .iter()
                            .take(3)
                            .filter_map(|c| c.get("id").and_then(|v| v.as_str()))
                            .collect();
                        if !names.is_empty() {
                            parts.push(format!("// {label}: {}", names.join(", ")));
                        }
                    }
                }
            }
            let combined = parts.join("\n\n");
            if combined.trim().len() >= MIN_CONTEXT {
                stats.from_toolkit += 1;
                return combined;
            }
        }

        if finding.evidence.trim().len() >= MIN_CONTEXT {
            stats.from_evidence += 1;
            return format!("// finding-related code ({function}):\n{}", finding.evidence);
        }

        format!(
            "// finding: {}\n// description: {}\n// fetch the relevant code with the tools",
            finding.title,
            finding.description.chars().take(500).collect::<String>()
        )
    }
}

/// Group findings by module, then chunk to `group_size`, preserving input
/// order inside each group. Entries carry their original index so the
/// final output can be re-assembled in input order.
fn group_findings(findings: &[Finding], group_size: usize) -> Vec<Vec<(usize, &Finding)>> {
    let mut by_module: BTreeMap<String, Vec<(usize, &Finding)>> = BTreeMap::new();
    for (idx, finding) in findings.iter().enumerate() {
        by_module
            .entry(finding.group_module())
            .or_default()
            .push((idx, finding));
    }

    let mut groups = Vec::new();
    for (_, module_findings) in by_module {
        for chunk in module_findings.chunks(group_size) {
            groups.push(chunk.to_vec());
        }
    }
    groups
}

/// Knowledge bundle for one group: deduplicated topic knowledge matched to
/// each finding, plus soft-filter hints, plus preliminary false-positive
/// flags from the static knowledge base.
fn collect_group_knowledge(group: &[(usize, &Finding)]) -> String {
    let mut knowledge_sections: Vec<String> = Vec::new();
    let mut fp_hints: Vec<String> = Vec::new();

    for (_, finding) in group {
        let matched = knowledge::relevant_knowledge(finding);
        if !matched.is_empty() && !knowledge_sections.contains(&matched) {
            knowledge_sections.push(matched);
        }

        if let Some(hint) = &finding.soft_filter_hint {
            fp_hints.push(format!(
                "- [{}] exclusion rule [{}]: {}",
                finding.id, hint.rule_name, hint.reason
            ));
        } else if let Some(reason) =
            knowledge::is_likely_false_positive(&finding.category, &finding.description)
        {
            fp_hints.push(format!("- [{}] possible false positive: {reason}", finding.id));
        }
    }

    let mut sections = Vec::new();
    if !knowledge_sections.is_empty() {
        sections.push(format!(
            "## Targeted security knowledge\n{}",
            knowledge_sections.join("\n\n")
        ));
    }
    if !fp_hints.is_empty() {
        sections.push(format!("## Pre-judgment hints\n{}", fp_hints.join("\n")));
    }
    sections.join("\n\n")
}

/// Conservative normalisation of one verifier verdict:
/// - needs_review escalates to confirmed with confidence >= 60 (unresolved
///   findings go to human review as confirmed, never dropped)
/// - false_positive forces final_severity = none, and only false_positive
///   may carry none
fn normalise_verdict(finding: Finding, result: Value, code_context: &str) -> VerifiedFinding {
    let conclusion = result
        .get("conclusion")
        .and_then(|v| v.as_str())
        .unwrap_or("needs_review")
        .to_string();
    let mut confidence = result
        .get("confidence")
        .and_then(|v| v.as_u64())
        .unwrap_or(50)
        .min(100) as u8;

    let mut final_conclusion = conclusion.clone();
    if conclusion == "needs_review" {
        final_conclusion = "confirmed".to_string();
        confidence = confidence.max(60);
    }

    let status = VerificationStatus::from_conclusion(&final_conclusion);
    let mut final_severity = result
        .get("final_severity")
        .and_then(|v| v.as_str())
        .map(Severity::parse_lenient)
        .unwrap_or(finding.severity);
    if status == VerificationStatus::FalsePositive {
        final_severity = Severity::None;
    } else if final_severity == Severity::None {
        final_severity = finding.severity;
    }

    let reasoning = result
        .get("reasoning")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let recommendations = result
        .get("recommendation")
        .and_then(|v| v.as_str())
        .map(|r| vec![r.to_string()])
        .unwrap_or_default();

    VerifiedFinding {
        original_finding: finding,
        verification_status: status,
        final_severity,
        final_confidence: confidence,
        swap_rounds: vec![SwapRound {
            round_number: 1,
            agent_role: "verifier".to_string(),
            analysis: result.clone(),
            verdict: conclusion,
            confidence,
            notes: reasoning,
        }],
        verifier_result: result,
        manager_verdict: Value::Object(Default::default()),
        recommendations,
        code_context: code_context.chars().take(2000).collect(),
    }
}

fn extract_function_name(finding: &Finding) -> String {
    if !finding.location.function.is_empty() {
        return finding.location.function.clone();
    }
    // Regex extraction from title/description as the fallback
    static FUNC_RES: once_cell::sync::Lazy<Vec<regex::Regex>> = once_cell::sync::Lazy::new(|| {
        [r"`(\w+)`", r"::(\w+)", r"\b(\w+)\s*\(\)"]
            .iter()
            .map(|p| regex::Regex::new(p).expect("function name regex"))
            .collect()
    });
    let haystack = format!("{} {}", finding.title, finding.description);
    for re in FUNC_RES.iter() {
        if let Some(caps) = re.captures(&haystack) {
            return caps[1].to_string();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Location;

    fn finding(id: &str, module: &str, function: &str) -> Finding {
        Finding {
            id: id.into(),
            title: format!("issue in {function}"),
            severity: Severity::High,
            category: "access_control".into(),
            location: Location::new(module, function),
            description: "desc".into(),
            evidence: "evidence code that is long enough to stand in for a context".into(),
            attack_scenario: None,
            recommendation: None,
            confidence: 70,
            phase2_context: None,
            phase2_func_context: None,
            module_name: None,
            soft_filter_hint: None,
        }
    }

    #[test]
    fn grouping_respects_module_and_size() {
        let findings = vec![
            finding("V-1", "demo::pool", "withdraw"),
            finding("V-2", "demo::pool", "deposit"),
            finding("V-3", "demo::acl", "add_role"),
            finding("V-4", "demo::pool", "borrow"),
        ];
        let groups = group_findings(&findings, 2);
        // acl: one group of 1; pool: two groups (2 + 1)
        assert_eq!(groups.len(), 3);
        let pool_groups: Vec<_> = groups
            .iter()
            .filter(|g| g[0].1.group_module() == "demo::pool")
            .collect();
        assert_eq!(pool_groups[0].len(), 2);
        // input order preserved inside the module
        assert_eq!(pool_groups[0][0].1.id, "V-1");
        assert_eq!(pool_groups[0][1].1.id, "V-2");
        assert_eq!(pool_groups[1][0].1.id, "V-4");
    }

    #[test]
    fn needs_review_escalates_to_confirmed() {
        let verdict = serde_json::json!({
            "conclusion": "needs_review",
            "confidence": 40,
            "final_severity": "high",
        });
        let verified = normalise_verdict(finding("V-1", "m", "f"), verdict, "ctx");
        assert_eq!(verified.verification_status, VerificationStatus::Confirmed);
        assert_eq!(verified.final_confidence, 60);
        assert_eq!(verified.final_severity, Severity::High);
        // the raw verdict stays visible in the trace
        assert_eq!(verified.swap_rounds[0].verdict, "needs_review");
    }

    #[test]
    fn false_positive_forces_severity_none() {
        let verdict = serde_json::json!({
            "conclusion": "false_positive",
            "confidence": 95,
            "final_severity": "high",
        });
        let verified = normalise_verdict(finding("V-1", "m", "f"), verdict, "ctx");
        assert_eq!(verified.verification_status, VerificationStatus::FalsePositive);
        assert_eq!(verified.final_severity, Severity::None);
    }

    #[test]
    fn none_severity_without_false_positive_is_rejected() {
        let verdict = serde_json::json!({
            "conclusion": "confirmed",
            "confidence": 80,
            "final_severity": "none",
        });
        let verified = normalise_verdict(finding("V-1", "m", "f"), verdict, "ctx");
        assert_eq!(verified.final_severity, Severity::High);
    }

    #[test]
    fn function_name_extraction_falls_back_to_text() {
        let mut f = finding("V-1", "demo::pool", "");
        f.title = "missing check in `set_admin` function".into();
        assert_eq!(extract_function_name(&f), "set_admin");
    }

    #[test]
    fn knowledge_bundle_dedups_topics() {
        let f1 = {
            let mut f = finding("V-1", "m", "a");
            f.title = "flashloan has no enforced repayment".into();
            f.category = "flashloan".into();
            f
        };
        let f2 = {
            let mut f = finding("V-2", "m", "b");
            f.title = "flash loan repayment not enforced".into();
            f.category = "flashloan".into();
            f
        };
        let group: Vec<(usize, &Finding)> = vec![(0, &f1), (1, &f2)];
        let bundle = collect_group_knowledge(&group);
        // the hot-potato topic appears once even though both findings match it
        assert_eq!(bundle.matches("Hot-potato enforcement").count(), 1);
    }
}
