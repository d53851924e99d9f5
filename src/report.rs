//! Phase 5 - deterministic report assembly
//!
//! Sorting, statistics and Markdown rendering. No LLM involvement: the
//! same verified findings always produce the same report.

use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::types::{
    AuditResult, AuditStats, ExploitStatus, ExploitVerificationReport, Severity,
    VerificationStatus, VerifiedFinding,
};

/// Report ordering: severity (critical first), then confidence descending,
/// then stable id.
pub fn sort_findings(mut findings: Vec<VerifiedFinding>) -> Vec<VerifiedFinding> {
    findings.sort_by(|a, b| {
        a.final_severity
            .rank()
            .cmp(&b.final_severity.rank())
            .then_with(|| b.final_confidence.cmp(&a.final_confidence))
            .then_with(|| a.original_finding.id.cmp(&b.original_finding.id))
    });
    findings
}

/// Statistics over the verified findings. Severity counts cover confirmed
/// findings only; false positives are counted separately and excluded from
/// the severity totals.
pub fn compute_stats(findings: &[VerifiedFinding]) -> AuditStats {
    let mut stats = AuditStats::default();
    for verified in findings {
        match verified.verification_status {
            VerificationStatus::Confirmed | VerificationStatus::PartiallyValid => {
                stats.total_confirmed += 1;
                *stats
                    .severity_counts
                    .entry(verified.final_severity.as_str().to_string())
                    .or_insert(0) += 1;
            }
            VerificationStatus::FalsePositive => stats.total_false_positive += 1,
            VerificationStatus::NeedsReview => stats.total_needs_review += 1,
        }
    }
    stats
}

/// Render the full audit result as Markdown
pub fn render_markdown(result: &AuditResult) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Security Audit Report: {}\n\n", result.project_name));
    out.push_str(&format!("- audit id: `{}`\n", result.audit_id));
    out.push_str(&format!("- status: {:?}\n", result.status));
    out.push_str(&format!(
        "- started: {} / finished: {}\n\n",
        result.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        result.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
    ));

    // Summary table
    out.push_str("## Summary\n\n");
    out.push_str(&format!(
        "- raw findings scanned: {}\n- confirmed: {}\n- false positives: {}\n- needs review: {}\n\n",
        result.stats.total_raw_findings,
        result.stats.total_confirmed,
        result.stats.total_false_positive,
        result.stats.total_needs_review,
    ));
    if !result.stats.severity_counts.is_empty() {
        out.push_str("| severity | confirmed |\n|---|---|\n");
        for severity in ["critical", "high", "medium", "low", "advisory"] {
            if let Some(count) = result.stats.severity_counts.get(severity) {
                out.push_str(&format!("| {severity} | {count} |\n"));
            }
        }
        out.push('\n');
    }

    // Token usage per role
    if !result.token_usage.is_empty() {
        out.push_str("## Token usage\n\n| role | calls | prompt | completion | total |\n|---|---|---|---|---|\n");
        let mut roles: Vec<_> = result.token_usage.iter().collect();
        roles.sort_by_key(|(role, _)| role.as_str().to_string());
        for (role, usage) in roles {
            out.push_str(&format!(
                "| {role} | {} | {} | {} | {} |\n",
                usage.call_count, usage.prompt_tokens, usage.completion_tokens, usage.total_tokens,
            ));
        }
        out.push('\n');
    }

    // Findings
    out.push_str("## Findings\n");
    let mut rendered_any = false;
    for verified in &result.findings {
        if verified.verification_status == VerificationStatus::FalsePositive {
            continue;
        }
        rendered_any = true;
        render_finding(&mut out, verified, result.exploit_reports.get(&verified.original_finding.id));
    }
    if !rendered_any {
        out.push_str("\nNo confirmed findings.\n");
    }

    // False positives, for transparency
    let false_positives: Vec<_> = result
        .findings
        .iter()
        .filter(|v| v.verification_status == VerificationStatus::FalsePositive)
        .collect();
    if !false_positives.is_empty() {
        out.push_str("\n## Dismissed findings (false positives)\n\n");
        for verified in false_positives {
            let mechanism = verified
                .verifier_result
                .get("mechanism_name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            out.push_str(&format!(
                "- **{}** ({}): {}\n",
                verified.original_finding.title,
                verified.original_finding.location.func_id(),
                if mechanism.is_empty() { "dismissed by verification" } else { mechanism },
            ));
        }
    }

    out
}

fn render_finding(
    out: &mut String,
    verified: &VerifiedFinding,
    exploit: Option<&ExploitVerificationReport>,
) {
    let finding = &verified.original_finding;
    out.push_str(&format!(
        "\n### [{}] {} - {}\n\n",
        verified.final_severity.as_str().to_uppercase(),
        finding.id,
        finding.title,
    ));
    out.push_str(&format!(
        "- location: `{}`\n- category: {}\n- status: {} (confidence {}%)\n\n",
        finding.location.func_id(),
        finding.category,
        verified.verification_status.as_str(),
        verified.final_confidence,
    ));
    if !finding.description.is_empty() {
        out.push_str(&format!("{}\n\n", finding.description));
    }
    if !finding.evidence.is_empty() {
        out.push_str(&format!("```move\n{}\n```\n\n", finding.evidence));
    }
    if let Some(reasoning) = verified
        .verifier_result
        .get("reasoning")
        .and_then(|v| v.as_str())
    {
        if !reasoning.is_empty() {
            out.push_str(&format!("**Verification**: {reasoning}\n\n"));
        }
    }
    for recommendation in &verified.recommendations {
        out.push_str(&format!("**Recommendation**: {recommendation}\n\n"));
    }

    if let Some(report) = exploit {
        render_exploit_report(out, report);
    }
}

fn render_exploit_report(out: &mut String, report: &ExploitVerificationReport) {
    let marker = match report.status {
        ExploitStatus::Verified => "VERIFIED EXPLOITABLE",
        ExploitStatus::Likely => "LIKELY EXPLOITABLE",
        ExploitStatus::NeedsReview => "NEEDS REVIEW",
        ExploitStatus::Theoretical => "THEORETICAL",
        ExploitStatus::FalsePositive => "NOT EXPLOITABLE",
    };
    out.push_str(&format!(
        "#### Exploit analysis: {marker} (score {}/10, confidence {}%)\n\n",
        report.exploitability_score, report.confidence_score,
    ));
    if !report.one_liner_exploit.is_empty() {
        out.push_str(&format!("> {}\n\n", report.one_liner_exploit));
    }
    if let Some(entry) = &report.entry_point {
        out.push_str(&format!(
            "- entry point: `{}` ({}), caller needs: {}\n",
            entry.function, entry.visibility, entry.caller_requirement,
        ));
    }
    if !report.attack_path.is_empty() {
        out.push_str("\n**Attack path**:\n");
        for step in &report.attack_path {
            out.push_str(&format!("1. {}", step.action));
            if !step.function_call.is_empty() {
                out.push_str(&format!(" (`{}`)", step.function_call));
            }
            if !step.state_change.is_empty() {
                out.push_str(&format!(" - {}", step.state_change));
            }
            out.push('\n');
        }
    }
    if !report.preconditions.is_empty() {
        out.push_str("\n**Preconditions**:\n");
        for pre in &report.preconditions {
            out.push_str(&format!(
                "- {} (difficulty: {}, realistic: {})\n",
                pre.condition, pre.difficulty, pre.realistic,
            ));
        }
    }
    if let Some(impact) = &report.impact {
        out.push_str(&format!(
            "\n**Impact**: {} (max loss: {})\n",
            impact.description, impact.max_loss,
        ));
    }
    if !report.poc_code.is_empty() {
        out.push_str(&format!("\n**PoC**:\n```move\n{}\n```\n", report.poc_code));
    }
    if let Some(reason) = &report.why_not_exploitable {
        out.push_str(&format!("\n**Why not exploitable**: {reason}\n"));
    }
    out.push('\n');
}

/// Write the Markdown report to `<output_dir>/<project>-audit.md`
pub fn write_markdown_report(result: &AuditResult, output_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;
    let slug: String = result
        .project_name
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let path = output_dir.join(format!("{slug}-audit.md"));
    std::fs::write(&path, render_markdown(result))?;
    info!(path = %path.display(), "markdown report written");
    Ok(())
}

/// Token totals across roles (monotone within one audit)
pub fn total_token_usage(usage: &HashMap<String, crate::types::TokenUsage>) -> crate::types::TokenUsage {
    let mut total = crate::types::TokenUsage::default();
    for role_usage in usage.values() {
        total.add(role_usage);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Finding, Location, SwapRound};
    use chrono::Utc;

    fn verified(id: &str, severity: Severity, confidence: u8, status: VerificationStatus) -> VerifiedFinding {
        VerifiedFinding {
            original_finding: Finding {
                id: id.into(),
                title: format!("finding {id}"),
                severity,
                category: "logic".into(),
                location: Location::new("demo::pool", "withdraw"),
                description: "d".into(),
                evidence: "e".into(),
                attack_scenario: None,
                recommendation: None,
                confidence,
                phase2_context: None,
                phase2_func_context: None,
                module_name: None,
                soft_filter_hint: None,
            },
            verification_status: status,
            final_severity: if status == VerificationStatus::FalsePositive {
                Severity::None
            } else {
                severity
            },
            final_confidence: confidence,
            swap_rounds: vec![SwapRound {
                round_number: 1,
                agent_role: "verifier".into(),
                analysis: serde_json::json!({}),
                verdict: "confirmed".into(),
                confidence,
                notes: String::new(),
            }],
            verifier_result: serde_json::json!({}),
            manager_verdict: serde_json::json!({}),
            recommendations: vec![],
            code_context: String::new(),
        }
    }

    #[test]
    fn sorting_is_severity_then_confidence_then_id() {
        let findings = vec![
            verified("V-3", Severity::Medium, 90, VerificationStatus::Confirmed),
            verified("V-2", Severity::Critical, 70, VerificationStatus::Confirmed),
            verified("V-1", Severity::Critical, 90, VerificationStatus::Confirmed),
            verified("V-0", Severity::Critical, 90, VerificationStatus::Confirmed),
        ];
        let sorted = sort_findings(findings);
        let ids: Vec<&str> = sorted.iter().map(|v| v.original_finding.id.as_str()).collect();
        assert_eq!(ids, vec!["V-0", "V-1", "V-2", "V-3"]);
    }

    #[test]
    fn stats_exclude_false_positives_from_severity_totals() {
        let findings = vec![
            verified("V-1", Severity::High, 90, VerificationStatus::Confirmed),
            verified("V-2", Severity::High, 90, VerificationStatus::Confirmed),
            verified("V-3", Severity::High, 90, VerificationStatus::FalsePositive),
            verified("V-4", Severity::Low, 50, VerificationStatus::NeedsReview),
        ];
        let stats = compute_stats(&findings);
        assert_eq!(stats.total_confirmed, 2);
        assert_eq!(stats.total_false_positive, 1);
        assert_eq!(stats.total_needs_review, 1);
        // sum of severity counts equals total confirmed
        let sum: usize = stats.severity_counts.values().sum();
        assert_eq!(sum, stats.total_confirmed);
    }

    #[test]
    fn markdown_includes_confirmed_and_lists_false_positives_separately() {
        let result = AuditResult {
            audit_id: "a-1".into(),
            project_name: "demo".into(),
            status: crate::types::AuditStatus::Completed,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            findings: vec![
                verified("V-1", Severity::High, 90, VerificationStatus::Confirmed),
                verified("V-2", Severity::High, 90, VerificationStatus::FalsePositive),
            ],
            exploit_reports: HashMap::new(),
            stats: compute_stats(&[
                verified("V-1", Severity::High, 90, VerificationStatus::Confirmed),
                verified("V-2", Severity::High, 90, VerificationStatus::FalsePositive),
            ]),
            token_usage: HashMap::new(),
            error: None,
        };
        let markdown = render_markdown(&result);
        assert!(markdown.contains("finding V-1"));
        assert!(markdown.contains("Dismissed findings"));
        assert!(markdown.contains("finding V-2"));
        // the dismissed finding is not rendered as a confirmed entry
        assert!(!markdown.contains("### [NONE]"));
    }
}
