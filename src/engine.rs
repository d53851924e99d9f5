//! Security audit engine - the six-phase scheduler
//!
//! Phases are strictly sequential; work inside a phase fans out under
//! bounded concurrency and is collected in input order. Cancellation is
//! checked before each phase, each new LLM call site and each scheduled
//! group; in-flight requests finish but their results are discarded.
//!
//! Phase 0  index build (no LLM calls)
//! Phase 1  structural analysis (Analyst)
//! Phase 2  raw vulnerability scan (Auditor)
//! Phase 3  verification (Verifier via the role-swap pipeline)
//! Phase 4  exploit-chain analysis (WhiteHat, HIGH/CRITICAL only)
//! Phase 5  report assembly (deterministic)

use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::agents::analyst::AnalystAgent;
use crate::agents::auditor::{AuditorAgent, FunctionScanContext};
use crate::agents::manager::ManagerAgent;
use crate::agents::verifier::VerifierAgent;
use crate::agents::whitehat::WhiteHatAgent;
use crate::config::AuditConfig;
use crate::error::{AuditError, Result};
use crate::indexer::ProjectIndex;
use crate::llm::{create_provider, LlmProvider, ProviderFactory};
use crate::report;
use crate::toolkit::{AgentToolkit, ContractAnalysis};
use crate::types::{
    AuditResult, AuditStats, AuditStatus, CancelToken, ExploitVerificationReport, Finding,
    ProgressCallback, Severity, TokenUsage, VerificationStatus, VerifiedFinding,
};
use crate::verify::RoleSwapVerifier;

/// Everything the pipeline accumulates before Phase 5
struct PipelineOutput {
    findings: Vec<VerifiedFinding>,
    exploit_reports: HashMap<String, ExploitVerificationReport>,
    stats: AuditStats,
}

/// The agents of one audit, created over a shared toolkit
struct AgentSet {
    analyst: AnalystAgent,
    auditor: AuditorAgent,
    verifier: Arc<VerifierAgent>,
    whitehat: WhiteHatAgent,
    /// Declared but short-circuited by the current verification policy
    manager: ManagerAgent,
}

pub struct SecurityAuditEngine {
    config: AuditConfig,
    provider: Arc<dyn LlmProvider>,
    /// How sub-agents obtain their isolated provider instances
    sub_factory: Option<ProviderFactory>,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,
}

impl SecurityAuditEngine {
    pub fn new(config: AuditConfig) -> Result<Self> {
        config.validate()?;
        let provider = create_provider(&config.llm)?;
        Ok(Self {
            config,
            provider,
            sub_factory: None,
            cancel: CancelToken::new(),
            progress: None,
        })
    }

    /// Engine with an externally-supplied provider (tests, gateways).
    /// Sub-agents share the injected provider instead of creating fresh
    /// ones.
    pub fn with_provider(config: AuditConfig, provider: Arc<dyn LlmProvider>) -> Result<Self> {
        config.validate()?;
        let shared = provider.clone();
        Ok(Self {
            config,
            provider,
            sub_factory: Some(Arc::new(move || Ok(shared.clone()))),
            cancel: CancelToken::new(),
            progress: None,
        })
    }

    /// Install a progress listener `(phase, percent, message)`. The
    /// callback must be non-blocking; concurrent tasks may fire it.
    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Token observed at every phase boundary and LLM call site. Cloneable;
    /// hand it to whatever owns the cancel button.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn report_progress(&self, phase: u8, percent: f32, message: &str) {
        debug!(phase, percent, message, "progress");
        if let Some(callback) = &self.progress {
            callback(phase, percent, message);
        }
    }

    /// Run the full audit. Always returns a result record: completed audits
    /// carry the report data, cancelled/failed audits carry the status and
    /// error. Findings from phases that completed before a failure are not
    /// part of the final report (Phase 5 never ran over them).
    pub async fn audit(&self, source_path: &Path, project_name: &str) -> AuditResult {
        let audit_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(audit_id, project = project_name, "audit started");

        let agents_usage: Arc<std::sync::Mutex<HashMap<String, TokenUsage>>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));

        let outcome = self.run_pipeline(source_path, &agents_usage).await;
        let finished_at = Utc::now();
        let token_usage = agents_usage.lock().map(|u| u.clone()).unwrap_or_default();

        match outcome {
            Ok(output) => {
                info!(
                    audit_id,
                    findings = output.findings.len(),
                    "audit completed"
                );
                let result = AuditResult {
                    audit_id,
                    project_name: project_name.to_string(),
                    status: AuditStatus::Completed,
                    started_at,
                    finished_at,
                    findings: output.findings,
                    exploit_reports: output.exploit_reports,
                    stats: output.stats,
                    token_usage,
                    error: None,
                };
                if let Some(dir) = &self.config.output_dir {
                    if let Err(e) = report::write_markdown_report(&result, dir) {
                        warn!(error = %e, "failed to write markdown report");
                    }
                }
                result
            }
            Err(e) => {
                let status = if e.is_cancelled() {
                    info!(audit_id, "audit cancelled");
                    AuditStatus::Cancelled
                } else {
                    warn!(audit_id, error = %e, "audit failed");
                    AuditStatus::Failed
                };
                AuditResult {
                    audit_id,
                    project_name: project_name.to_string(),
                    status,
                    started_at,
                    finished_at,
                    findings: Vec::new(),
                    exploit_reports: HashMap::new(),
                    stats: AuditStats::default(),
                    token_usage,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn run_pipeline(
        &self,
        source_path: &Path,
        usage_sink: &Arc<std::sync::Mutex<HashMap<String, TokenUsage>>>,
    ) -> Result<PipelineOutput> {
        // ------------------------------------------------------------
        // Phase 0: index build (no LLM involvement)
        // ------------------------------------------------------------
        self.cancel.check()?;
        self.report_progress(0, 0.0, "building project index");
        let index = Arc::new(ProjectIndex::build(
            source_path,
            self.config.enable_context_system,
        )?);
        self.report_progress(
            0,
            100.0,
            &format!(
                "index built: {} modules, {} functions, callgraph {}",
                index.modules.len(),
                index.function_count(),
                index.callgraph_status.as_str()
            ),
        );

        let toolkit = Arc::new(AgentToolkit::new(index.clone()));
        let agents = self.create_agents(&toolkit);

        let record_usage = |agents: &AgentSet| {
            if let Ok(mut sink) = usage_sink.lock() {
                sink.insert("analyst".into(), agents.analyst.agent().token_usage());
                sink.insert("auditor".into(), agents.auditor.agent().token_usage());
                sink.insert("verifier".into(), agents.verifier.agent().token_usage());
                sink.insert("whitehat".into(), agents.whitehat.agent().token_usage());
                sink.insert("manager".into(), agents.manager.agent().token_usage());
            }
        };

        // ------------------------------------------------------------
        // Phase 1: structural analysis
        // ------------------------------------------------------------
        self.cancel.check()?;
        self.report_progress(1, 0.0, "structural analysis");
        if index.function_count() > 0 {
            let outcome = self.run_phase1(&index, &toolkit, &agents).await;
            record_usage(&agents);
            if let Err(e) = outcome {
                if e.is_cancelled() {
                    return Err(e);
                }
                // Structural analysis is an accelerator; its loss degrades
                // context but does not halt the audit.
                warn!(error = %e, "structural analysis failed, continuing without hints");
            }
        }
        self.report_progress(1, 100.0, "structural analysis done");

        // ------------------------------------------------------------
        // Phase 2: raw vulnerability scan
        // ------------------------------------------------------------
        self.cancel.check()?;
        self.report_progress(2, 0.0, "vulnerability scan");
        let raw_findings = self.run_phase2(&index, &toolkit, &agents).await?;
        record_usage(&agents);
        self.report_progress(
            2,
            100.0,
            &format!("scan done: {} raw findings", raw_findings.len()),
        );
        let total_raw = raw_findings.len();

        // ------------------------------------------------------------
        // Phase 3: verification
        // ------------------------------------------------------------
        self.cancel.check()?;
        self.report_progress(3, 0.0, &format!("verifying {total_raw} findings"));
        let (verified, context_stats) = if self.config.enable_role_swap && !raw_findings.is_empty()
        {
            let pipeline = RoleSwapVerifier::new(
                agents.verifier.clone(),
                toolkit.clone(),
                &self.config,
                self.cancel.clone(),
            );
            pipeline.batch_verify(raw_findings).await?
        } else {
            // Verification disabled: findings pass through unjudged
            (
                raw_findings
                    .into_iter()
                    .map(passthrough_verified)
                    .collect(),
                Default::default(),
            )
        };
        record_usage(&agents);
        debug_assert_eq!(verified.len(), total_raw);
        self.report_progress(3, 100.0, &format!("verified {} findings", verified.len()));

        // ------------------------------------------------------------
        // Phase 4: exploit-chain analysis (HIGH/CRITICAL confirmed only)
        // ------------------------------------------------------------
        self.cancel.check()?;
        let mut exploit_reports = HashMap::new();
        if self.config.enable_exploit_verification {
            self.report_progress(4, 0.0, "exploit-chain analysis");
            exploit_reports = self.run_phase4(&verified, &toolkit, &agents).await?;
            record_usage(&agents);
            self.report_progress(
                4,
                100.0,
                &format!("exploit analysis done: {} reports", exploit_reports.len()),
            );
        } else {
            self.report_progress(4, 100.0, "exploit-chain analysis disabled");
        }

        // ------------------------------------------------------------
        // Phase 5: report assembly (deterministic)
        // ------------------------------------------------------------
        self.cancel.check()?;
        self.report_progress(5, 0.0, "assembling report");
        let findings = report::sort_findings(verified);
        let mut stats = report::compute_stats(&findings);
        stats.total_raw_findings = total_raw;
        stats.context_from_phase2 = context_stats.from_phase2;
        stats.context_from_toolkit = context_stats.from_toolkit;
        stats.context_from_evidence = context_stats.from_evidence;
        record_usage(&agents);
        self.report_progress(5, 100.0, "report assembled");

        Ok(PipelineOutput {
            findings,
            exploit_reports,
            stats,
        })
    }

    fn create_agents(&self, toolkit: &Arc<AgentToolkit>) -> AgentSet {
        AgentSet {
            analyst: AnalystAgent::new(
                self.config.llm.clone(),
                self.provider.clone(),
                toolkit.clone(),
                self.cancel.clone(),
            ),
            auditor: AuditorAgent::new(
                self.config.llm.clone(),
                self.provider.clone(),
                toolkit.clone(),
                self.cancel.clone(),
            ),
            verifier: Arc::new(VerifierAgent::new(
                self.config.llm.clone(),
                self.provider.clone(),
                toolkit.clone(),
                self.cancel.clone(),
            )),
            whitehat: {
                let whitehat = WhiteHatAgent::new(
                    self.config.llm.clone(),
                    self.provider.clone(),
                    toolkit.clone(),
                    self.cancel.clone(),
                );
                match &self.sub_factory {
                    Some(factory) => whitehat.with_sub_provider_factory(factory.clone()),
                    None => whitehat,
                }
            },
            manager: ManagerAgent::new(
                self.config.llm.clone(),
                self.provider.clone(),
                self.cancel.clone(),
            ),
        }
    }

    // ------------------------------------------------------------------
    // Phase 1
    // ------------------------------------------------------------------

    async fn run_phase1(
        &self,
        index: &Arc<ProjectIndex>,
        toolkit: &Arc<AgentToolkit>,
        agents: &AgentSet,
    ) -> Result<()> {
        let combined_code = combined_source(index);

        // Call-graph context focuses the hints on risky functions
        let callgraph_context = if index.callgraph_status.is_ok() {
            let summary = toolkit.call_tool(
                "get_callgraph_summary",
                &serde_json::json!({}),
                "analyst",
            );
            summary
                .success
                .then(|| format!("## Call graph summary\n{}", summary.data))
        } else {
            None
        };

        self.cancel.check()?;
        self.report_progress(1, 20.0, "extracting analysis hints");
        let hints = agents
            .analyst
            .extract_analysis_hints(&combined_code, callgraph_context.as_deref())
            .await?;

        self.cancel.check()?;
        self.report_progress(1, 50.0, "describing function purposes");
        let functions: Vec<(String, String)> = index
            .chunks
            .iter()
            .map(|c| (c.id.clone(), c.signature.clone()))
            .collect();
        let purposes = agents
            .analyst
            .analyze_function_purposes(
                &functions,
                &combined_code,
                5,
                self.config.concurrency.max_concurrent_analysis,
            )
            .await?;

        // Later phases retrieve this through the toolkit
        toolkit.set_contract_analysis(ContractAnalysis {
            analysis_hints: hints,
            function_purposes: purposes,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase 2
    // ------------------------------------------------------------------

    async fn run_phase2(
        &self,
        index: &Arc<ProjectIndex>,
        toolkit: &Arc<AgentToolkit>,
        agents: &AgentSet,
    ) -> Result<Vec<Finding>> {
        let mut all_findings: Vec<Finding> = Vec::new();

        // Primary scan: batched function analysis
        let batches = build_scan_batches(index, self.config.scan_batch_size);
        info!(batches = batches.len(), "batched function scan");

        let semaphore = Arc::new(Semaphore::new(
            self.config.concurrency.max_concurrent_analysis.max(1),
        ));
        let cooldown = Duration::from_secs_f64(self.config.concurrency.batch_cooldown_secs);
        let auditor = &agents.auditor;
        let cancel = &self.cancel;

        let tasks = batches.iter().enumerate().map(|(batch_id, batch)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                if cancel.is_cancelled() {
                    return (batch_id, Err(AuditError::Cancelled));
                }
                let outcome = auditor.analyze_functions_batch(batch, batch_id).await;
                if !cooldown.is_zero() {
                    tokio::time::sleep(cooldown).await;
                }
                (batch_id, outcome)
            }
        });

        // Accumulate in batch order, regardless of completion order
        let mut batch_results: Vec<Option<crate::agents::auditor::BatchScanResult>> =
            (0..batches.len()).map(|_| None).collect();
        for (batch_id, outcome) in join_all(tasks).await {
            match outcome {
                Ok(result) => batch_results[batch_id] = Some(result),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(batch = batch_id, error = %e, "scan batch failed, skipping");
                }
            }
            let done = batch_results.iter().filter(|r| r.is_some()).count();
            self.report_progress(
                2,
                (done as f32 / batches.len().max(1) as f32) * 80.0,
                &format!("scanned batch {done}/{}", batches.len()),
            );
        }

        for (batch_id, result) in batch_results.into_iter().enumerate() {
            let Some(result) = result else { continue };
            let batch = &batches[batch_id];
            for mut finding in result.findings {
                attach_phase2_context(&mut finding, batch, toolkit);
                all_findings.push(finding);
            }
            for mut finding in result.cross_function_issues {
                finding.module_name = Some(
                    batch
                        .first()
                        .map(|c| c.module_name.clone())
                        .unwrap_or_default(),
                );
                all_findings.push(finding);
            }
        }

        // Optional broad / targeted passes over whole modules
        if self.config.enable_broad_analysis {
            self.cancel.check()?;
            self.report_progress(2, 85.0, "broad analysis");
            for (module_name, module) in &index.modules {
                self.cancel.check()?;
                match agents.auditor.broad_analysis(module_name, &module.raw_content).await {
                    Ok(findings) => all_findings.extend(findings),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => warn!(module = %module_name, error = %e, "broad analysis failed"),
                }
            }
        }

        if self.config.enable_targeted_analysis {
            self.cancel.check()?;
            self.report_progress(2, 92.0, "targeted analysis");
            for vuln_type in &self.config.targeted_vuln_types {
                for (module_name, module) in &index.modules {
                    self.cancel.check()?;
                    match agents
                        .auditor
                        .targeted_analysis(module_name, &module.raw_content, vuln_type)
                        .await
                    {
                        Ok(findings) => all_findings.extend(findings),
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) => {
                            warn!(module = %module_name, vuln_type, error = %e, "targeted analysis failed")
                        }
                    }
                }
            }
        }

        Ok(dedup_findings(all_findings))
    }

    // ------------------------------------------------------------------
    // Phase 4
    // ------------------------------------------------------------------

    async fn run_phase4(
        &self,
        verified: &[VerifiedFinding],
        toolkit: &Arc<AgentToolkit>,
        agents: &AgentSet,
    ) -> Result<HashMap<String, ExploitVerificationReport>> {
        let targets: Vec<&VerifiedFinding> = verified
            .iter()
            .filter(|v| {
                let eligible = v.verification_status == VerificationStatus::Confirmed
                    && matches!(v.final_severity, Severity::High | Severity::Critical);
                if !eligible {
                    debug!(
                        finding = %v.original_finding.id,
                        status = v.verification_status.as_str(),
                        severity = %v.final_severity,
                        "skipping exploit analysis (below severity threshold or not confirmed)"
                    );
                }
                eligible
            })
            .collect();
        if targets.is_empty() {
            return Ok(HashMap::new());
        }
        info!(targets = targets.len(), "exploit-chain analysis targets");

        let semaphore = Arc::new(Semaphore::new(
            self.config.concurrency.max_concurrent_exploit.max(1),
        ));
        let whitehat = &agents.whitehat;
        let cancel = &self.cancel;
        let function_index = toolkit.function_index(100);

        let tasks = targets.iter().enumerate().map(|(i, target)| {
            let semaphore = semaphore.clone();
            let function_index = function_index.as_str();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                if cancel.is_cancelled() {
                    return (i, Err(AuditError::Cancelled));
                }
                let context = exploit_context(target, toolkit);
                let outcome = whitehat
                    .analyze_exploit_chain(target, &context, function_index)
                    .await;
                (i, outcome)
            }
        });

        let mut reports = HashMap::new();
        for (i, outcome) in join_all(tasks).await {
            let finding_id = targets[i].original_finding.id.clone();
            match outcome {
                Ok(report) => {
                    reports.insert(finding_id, report);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(finding = %finding_id, error = %e, "exploit analysis failed, skipping");
                }
            }
        }
        Ok(reports)
    }
}

/// Passthrough wrapper used when Phase 3 is disabled
fn passthrough_verified(finding: Finding) -> VerifiedFinding {
    let severity = finding.severity;
    let confidence = finding.confidence;
    VerifiedFinding {
        original_finding: finding,
        verification_status: VerificationStatus::Confirmed,
        final_severity: severity,
        final_confidence: confidence,
        swap_rounds: Vec::new(),
        verifier_result: serde_json::json!({ "note": "verification disabled" }),
        manager_verdict: serde_json::Value::Object(Default::default()),
        recommendations: Vec::new(),
        code_context: String::new(),
    }
}

/// All module sources concatenated, for Phase 1 prompts
fn combined_source(index: &ProjectIndex) -> String {
    index
        .modules
        .values()
        .map(|m| m.raw_content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build Phase 2 scan batches: per module, chunks of `batch_size`
/// functions, each entry carrying its type definitions and one-hop callee
/// implementations.
fn build_scan_batches(index: &ProjectIndex, batch_size: usize) -> Vec<Vec<FunctionScanContext>> {
    let mut batches = Vec::new();
    for (module_name, module) in &index.modules {
        let module_chunks: Vec<_> = index
            .chunks
            .iter()
            .filter(|c| &c.module == module_name)
            .collect();

        for chunk_group in module_chunks.chunks(batch_size.max(1)) {
            let mut batch = Vec::new();
            for chunk in chunk_group {
                let node = index.callgraph.get(&chunk.id);
                let callers: Vec<String> = node
                    .map(|n| n.called_by.iter().take(3).cloned().collect())
                    .unwrap_or_default();
                let callees: Vec<String> = node
                    .map(|n| n.calls.iter().take(3).cloned().collect())
                    .unwrap_or_default();

                // Struct definitions the function touches
                let type_definitions = module
                    .structs
                    .iter()
                    .filter(|s| chunk.related_types.contains(&s.name))
                    .map(|s| s.body.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");

                // One-hop callee bodies, capped to keep the prompt bounded
                let callee_implementations = callees
                    .iter()
                    .filter_map(|id| index.chunk_by_id(id))
                    .map(|c| truncate_chars(&c.body, 800))
                    .collect::<Vec<_>>()
                    .join("\n\n");

                batch.push(FunctionScanContext {
                    module_name: module_name.clone(),
                    function_name: chunk.name.clone(),
                    signature: chunk.signature.clone(),
                    visibility: chunk.visibility.clone(),
                    function_code: chunk.body.clone(),
                    risk_score: chunk.risk_indicators.risk_score,
                    callers,
                    callees,
                    type_definitions,
                    callee_implementations,
                });
            }
            batches.push(batch);
        }
    }
    batches
}

/// Attach `_phase2_context` and `_phase2_func_context` so Phase 3 does not
/// re-fetch code through the toolkit.
fn attach_phase2_context(
    finding: &mut Finding,
    batch: &[FunctionScanContext],
    index_toolkit: &AgentToolkit,
) {
    let ctx = batch
        .iter()
        .find(|c| c.function_name == finding.location.function)
        .or_else(|| batch.first());
    let Some(ctx) = ctx else { return };

    finding.module_name = Some(ctx.module_name.clone());
    if finding.location.module.is_empty() {
        finding.location.module = ctx.module_name.clone();
    }

    // Caller signatures: resolved from the index so the verifier can see
    // capability parameters on the wrappers
    let caller_signatures: Vec<String> = ctx
        .callers
        .iter()
        .filter_map(|id| index_toolkit.index().chunk_by_id(id))
        .map(|c| c.signature.clone())
        .collect();
    let callee_signatures: Vec<String> = ctx
        .callees
        .iter()
        .filter_map(|id| index_toolkit.index().chunk_by_id(id))
        .map(|c| c.signature.clone())
        .collect();

    let mut context = format!(
        "### {}::{}\n```move\n{}\n```",
        ctx.module_name, ctx.function_name, ctx.function_code
    );
    if !caller_signatures.is_empty() {
        context.push_str(&format!("\n// callers:\n//   {}", caller_signatures.join("\n//   ")));
    }
    if !callee_signatures.is_empty() {
        context.push_str(&format!("\n// callees:\n//   {}", callee_signatures.join("\n//   ")));
    }

    finding.phase2_context = Some(context);
    finding.phase2_func_context = Some(crate::types::FunctionContextSnapshot {
        function_code: ctx.function_code.clone(),
        caller_signatures,
        callee_signatures,
    });
}

/// Union of the scan modes, deduplicated by (module, function, category);
/// the first occurrence (batched scan) wins.
fn dedup_findings(findings: Vec<Finding>) -> Vec<Finding> {
    let mut seen = HashSet::new();
    findings
        .into_iter()
        .filter(|f| seen.insert(f.dedup_key()))
        .collect()
}

/// Retrieval context for one exploit analysis: target function, callers,
/// callees, recorded purpose and relevant hints.
fn exploit_context(verified: &VerifiedFinding, toolkit: &AgentToolkit) -> String {
    let finding = &verified.original_finding;
    let mut parts = Vec::new();

    if !verified.code_context.is_empty() {
        parts.push(verified.code_context.clone());
    } else if let Some(ctx) = &finding.phase2_context {
        parts.push(ctx.clone());
    } else {
        let result = toolkit.call_tool(
            "get_function_context",
            &serde_json::json!({
                "module": finding.group_module(),
                "function": finding.location.function,
                "depth": 2,
            }),
            "whitehat",
        );
        if result.success {
            parts.push(result.data.to_string());
        } else if !finding.evidence.is_empty() {
            parts.push(finding.evidence.clone());
        }
    }

    let purpose = toolkit.call_tool(
        "get_function_purpose",
        &serde_json::json!({ "function_id": finding.location.func_id() }),
        "whitehat",
    );
    if purpose.success {
        if let Some(text) = purpose.data.get("purpose").and_then(|v| v.as_str()) {
            parts.push(format!("// function purpose: {text}"));
        }
    }

    parts.join("\n\n")
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
    use crate::types::Location;

    fn finding(module: &str, function: &str, category: &str) -> Finding {
        Finding {
            id: format!("{module}-{function}-{category}"),
            title: "t".into(),
            severity: Severity::High,
            category: category.into(),
            location: Location::new(module, function),
            description: String::new(),
            evidence: String::new(),
            attack_scenario: None,
            recommendation: None,
            confidence: 50,
            phase2_context: None,
            phase2_func_context: None,
            module_name: None,
            soft_filter_hint: None,
        }
    }

    #[test]
    fn dedup_unions_by_module_function_category() {
        let findings = vec![
            finding("pool", "withdraw", "access_control"),
            finding("pool", "withdraw", "access_control"), // duplicate
            finding("pool", "withdraw", "overflow"),
            finding("pool", "deposit", "access_control"),
        ];
        let deduped = dedup_findings(findings);
        assert_eq!(deduped.len(), 3);
    }

    #[test]
    fn scan_batches_group_by_module() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sources")).unwrap();
        std::fs::write(
            dir.path().join("sources/a.move"),
            "module demo::a { public fun f1() { } public fun f2() { } public fun f3() { } }",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("sources/b.move"),
            "module demo::b { public fun g1() { } }",
        )
        .unwrap();
        let index = ProjectIndex::build(dir.path(), true).unwrap();
        let batches = build_scan_batches(&index, 2);
        // demo::a -> two batches (2 + 1), demo::b -> one batch
        assert_eq!(batches.len(), 3);
        assert!(batches
            .iter()
            .all(|b| b.iter().all(|c| c.module_name == b[0].module_name)));
    }
}
