//! Core data model shared across the audit pipeline
//!
//! Findings are created in Phase 2, annotated (never rewritten) by later
//! phases, and serialised into the final report. All types here are plain
//! data; the pipeline logic lives in `engine`, `verify` and the agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{AuditError, Result};

// ============================================================================
// Severity & Status Enums
// ============================================================================

/// Finding severity. `None` only appears as a `final_severity` on findings
/// judged false positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Advisory,
    None,
}

impl Severity {
    /// Rank for report ordering (critical first)
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
            Severity::Advisory => 4,
            Severity::None => 5,
        }
    }

    /// Parse a loosely-formatted severity string from an LLM response
    pub fn parse_lenient(s: &str) -> Severity {
        match s.trim().to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            "low" => Severity::Low,
            "advisory" | "info" | "informational" => Severity::Advisory,
            "none" => Severity::None,
            _ => Severity::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Advisory => "advisory",
            Severity::None => "none",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase 3 verification verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Confirmed,
    FalsePositive,
    NeedsReview,
    PartiallyValid,
}

impl VerificationStatus {
    /// Map a verifier conclusion string to a status
    pub fn from_conclusion(conclusion: &str) -> Self {
        match conclusion.trim().to_lowercase().as_str() {
            "confirmed" => VerificationStatus::Confirmed,
            "false_positive" => VerificationStatus::FalsePositive,
            "partially_valid" => VerificationStatus::PartiallyValid,
            _ => VerificationStatus::NeedsReview,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Confirmed => "confirmed",
            VerificationStatus::FalsePositive => "false_positive",
            VerificationStatus::NeedsReview => "needs_review",
            VerificationStatus::PartiallyValid => "partially_valid",
        }
    }
}

/// Phase 4 exploitability verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExploitStatus {
    Verified,
    Likely,
    NeedsReview,
    Theoretical,
    FalsePositive,
}

impl ExploitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExploitStatus::Verified => "verified",
            ExploitStatus::Likely => "likely",
            ExploitStatus::NeedsReview => "needs_review",
            ExploitStatus::Theoretical => "theoretical",
            ExploitStatus::FalsePositive => "false_positive",
        }
    }
}

// ============================================================================
// Findings
// ============================================================================

/// Source location of a finding
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
}

impl Location {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            code_snippet: None,
        }
    }

    /// `module::function` identifier, best effort
    pub fn func_id(&self) -> String {
        if self.module.is_empty() {
            self.function.clone()
        } else {
            format!("{}::{}", self.module, self.function)
        }
    }
}

/// Advisory annotation attached by the exclusion rules engine.
/// Never removes a finding; only informs the verifier prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftFilterHint {
    pub rule_name: String,
    pub reason: String,
    pub hint_for_ai: String,
}

/// Structured function context saved by Phase 2 so Phase 3 does not need
/// to re-fetch code through the toolkit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionContextSnapshot {
    #[serde(default)]
    pub function_code: String,
    #[serde(default)]
    pub caller_signatures: Vec<String>,
    #[serde(default)]
    pub callee_signatures: Vec<String>,
}

/// A raw vulnerability finding from Phase 2.
///
/// Later phases only add annotation fields (prefixed with `_` on the wire),
/// they never rewrite earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub description: String,
    /// Source-copied evidence; LLMs emit this as either `evidence` or `proof`
    #[serde(default, alias = "proof")]
    pub evidence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: u8,

    // --- Phase-added annotations ---
    /// Pre-built code context from Phase 2 (function + caller/callee signatures)
    #[serde(
        default,
        rename = "_phase2_context",
        skip_serializing_if = "Option::is_none"
    )]
    pub phase2_context: Option<String>,
    /// Structured code snapshot from Phase 2
    #[serde(
        default,
        rename = "_phase2_func_context",
        skip_serializing_if = "Option::is_none"
    )]
    pub phase2_func_context: Option<FunctionContextSnapshot>,
    /// Module name recorded during grouping
    #[serde(
        default,
        rename = "_module_name",
        skip_serializing_if = "Option::is_none"
    )]
    pub module_name: Option<String>,
    /// Soft-filter annotation from the exclusion rules engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_filter_hint: Option<SoftFilterHint>,
}

fn default_confidence() -> u8 {
    50
}

impl Finding {
    /// Module name for grouping: explicit annotation first, then location
    pub fn group_module(&self) -> String {
        if let Some(m) = &self.module_name {
            if !m.is_empty() {
                return m.clone();
            }
        }
        if self.location.module.is_empty() {
            "unknown".to_string()
        } else {
            self.location.module.clone()
        }
    }

    /// Dedup key for unioning Phase 2 modes
    pub fn dedup_key(&self) -> (String, String, String) {
        (
            self.location.module.to_lowercase(),
            self.location.function.to_lowercase(),
            self.category.to_lowercase(),
        )
    }
}

// ============================================================================
// Verified Findings (Phase 3 output)
// ============================================================================

/// One agent verdict in the verification trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRound {
    pub round_number: u32,
    /// "verifier" | "manager"
    pub agent_role: String,
    pub analysis: serde_json::Value,
    pub verdict: String,
    pub confidence: u8,
    #[serde(default)]
    pub notes: String,
}

/// A finding after Phase 3 verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedFinding {
    pub original_finding: Finding,
    pub verification_status: VerificationStatus,
    pub final_severity: Severity,
    pub final_confidence: u8,
    /// Ordered trace of agent verdicts
    pub swap_rounds: Vec<SwapRound>,
    /// Full verifier record
    pub verifier_result: serde_json::Value,
    /// Manager verdict (empty unless the manager was consulted)
    #[serde(default)]
    pub manager_verdict: serde_json::Value,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// The code context actually used during verification
    #[serde(default)]
    pub code_context: String,
}

impl VerifiedFinding {
    /// Conservative result for a finding whose verification call failed.
    /// Never a silent drop: the finding surfaces as needs_review.
    pub fn from_error(finding: Finding, error: &str) -> Self {
        let severity = finding.severity;
        Self {
            original_finding: finding,
            verification_status: VerificationStatus::NeedsReview,
            final_severity: severity,
            final_confidence: 0,
            swap_rounds: Vec::new(),
            verifier_result: serde_json::json!({ "error": error }),
            manager_verdict: serde_json::Value::Object(Default::default()),
            recommendations: vec![format!("verification failed: {error}")],
            code_context: String::new(),
        }
    }
}

// ============================================================================
// Exploit Verification (Phase 4 output)
// ============================================================================

/// One step in an attack path
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttackStep {
    #[serde(default, alias = "step_number")]
    pub step: u32,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub function_call: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub state_change: String,
}

/// A precondition the attacker must satisfy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Precondition {
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub how_to_achieve: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub realistic: bool,
}

/// Entry point of the exploit chain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryPoint {
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub visibility: String,
    #[serde(default)]
    pub caller_requirement: String,
}

/// Impact description of a successful exploit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExploitImpact {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub affected_parties: Vec<String>,
    #[serde(default)]
    pub max_loss: String,
}

/// Exploit-chain verification report produced by the WhiteHat agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploitVerificationReport {
    pub vulnerability_id: String,
    pub vulnerability_type: String,
    pub severity: Severity,
    pub status: ExploitStatus,
    /// 0-100
    pub confidence_score: f64,
    /// 0-10
    pub exploitability_score: f64,
    #[serde(default)]
    pub vulnerability_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<EntryPoint>,
    #[serde(default)]
    pub attack_path: Vec<AttackStep>,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<ExploitImpact>,
    #[serde(default)]
    pub poc_code: String,
    #[serde(default)]
    pub one_liner_exploit: String,
    #[serde(default)]
    pub why_exploitable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_not_exploitable: Option<String>,
    /// Similar historical cases from the pattern corpus (when available)
    #[serde(default)]
    pub similar_cases: Vec<String>,
    #[serde(default)]
    pub analysis_reasoning: String,
}

// ============================================================================
// Token Accounting
// ============================================================================

/// Snapshot of token usage for one agent role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub call_count: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.call_count += other.call_count;
    }
}

/// Lock-free accumulating token counters. Counters are monotonically
/// non-decreasing within an audit; stateless calls accumulate concurrently.
#[derive(Debug, Default)]
pub struct TokenCounters {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
    call_count: AtomicU64,
}

impl TokenCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one LLM call's usage
    pub fn track(&self, prompt: u64, completion: u64, total: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(total, Ordering::Relaxed);
        self.call_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Merge a terminal usage record (e.g. from a sub-agent)
    pub fn merge(&self, usage: &TokenUsage) {
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens
            .fetch_add(usage.total_tokens, Ordering::Relaxed);
        self.call_count.fetch_add(usage.call_count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            call_count: self.call_count.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Cancellation & Progress
// ============================================================================

/// Cooperative cancellation token. Checked before each phase, each new LLM
/// call and each scheduled group; in-flight HTTP requests are allowed to
/// finish but their results are discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Err(AuditError::Cancelled) once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AuditError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Progress callback: `(phase 0-5, percent 0-100, message)`.
/// Implementations must be non-blocking and thread-safe; multiple tasks may
/// fire concurrently.
pub type ProgressCallback = Arc<dyn Fn(u8, f32, &str) + Send + Sync>;

// ============================================================================
// Audit Result
// ============================================================================

/// Terminal status of an audit run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Completed,
    Cancelled,
    Failed,
}

/// Aggregate statistics over the verified findings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    /// Per-severity counts of confirmed findings only
    pub severity_counts: HashMap<String, usize>,
    pub total_confirmed: usize,
    pub total_false_positive: usize,
    pub total_needs_review: usize,
    pub total_raw_findings: usize,
    /// Code-retrieval path counters from Phase 3
    pub context_from_phase2: usize,
    pub context_from_toolkit: usize,
    pub context_from_evidence: usize,
}

/// Final output of `SecurityAuditEngine::audit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub audit_id: String,
    pub project_name: String,
    pub status: AuditStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Verified findings in report order
    pub findings: Vec<VerifiedFinding>,
    /// Exploit reports keyed by finding id
    pub exploit_reports: HashMap<String, ExploitVerificationReport>,
    pub stats: AuditStats,
    /// Token usage per agent role
    pub token_usage: HashMap<String, TokenUsage>,
    /// Error recorded when the pipeline halted early
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_is_critical_first() {
        assert!(Severity::Critical.rank() < Severity::High.rank());
        assert!(Severity::High.rank() < Severity::Medium.rank());
        assert!(Severity::Low.rank() < Severity::Advisory.rank());
        assert!(Severity::Advisory.rank() < Severity::None.rank());
    }

    #[test]
    fn severity_parses_leniently() {
        assert_eq!(Severity::parse_lenient(" HIGH "), Severity::High);
        assert_eq!(Severity::parse_lenient("informational"), Severity::Advisory);
        assert_eq!(Severity::parse_lenient("garbage"), Severity::Medium);
    }

    #[test]
    fn finding_accepts_proof_alias() {
        let f: Finding = serde_json::from_value(serde_json::json!({
            "id": "V-1",
            "title": "test",
            "severity": "high",
            "proof": "let x = 1;",
        }))
        .unwrap();
        assert_eq!(f.evidence, "let x = 1;");
        assert_eq!(f.confidence, 50);
    }

    #[test]
    fn token_counters_accumulate() {
        let counters = TokenCounters::new();
        counters.track(100, 50, 150);
        counters.track(10, 5, 15);
        let snap = counters.snapshot();
        assert_eq!(snap.prompt_tokens, 110);
        assert_eq!(snap.completion_tokens, 55);
        assert_eq!(snap.total_tokens, 165);
        assert_eq!(snap.call_count, 2);
    }

    #[test]
    fn cancel_token_reports_cancellation() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(AuditError::Cancelled)));
    }
}
