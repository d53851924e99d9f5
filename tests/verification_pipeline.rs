//! Phase 3 pipeline tests: soft filtering, grouped verification,
//! conservative normalisation and ordering guarantees.

mod common;

use common::{request_text, write_project, MockProvider, ACL_MODULES, FLASH_SAFE_MODULE};
use moveaudit::agents::verifier::VerifierAgent;
use moveaudit::config::{AuditConfig, LlmSettings};
use moveaudit::error::AuditError;
use moveaudit::indexer::ProjectIndex;
use moveaudit::toolkit::AgentToolkit;
use moveaudit::types::{
    CancelToken, Finding, FunctionContextSnapshot, Location, Severity, VerificationStatus,
};
use moveaudit::verify::RoleSwapVerifier;
use std::sync::Arc;

fn finding(id: &str, title: &str, category: &str, module: &str, function: &str) -> Finding {
    Finding {
        id: id.into(),
        title: title.into(),
        severity: Severity::High,
        category: category.into(),
        location: Location::new(module, function),
        description: title.to_string(),
        evidence: "assert!(contains_type<A>(pool), 0); // evidence long enough to use".into(),
        attack_scenario: None,
        recommendation: None,
        confidence: 70,
        phase2_context: None,
        phase2_func_context: None,
        module_name: None,
        soft_filter_hint: None,
    }
}

/// Build the pipeline over the given fixture and handler
fn pipeline(
    dir: &tempfile::TempDir,
    provider: Arc<MockProvider>,
    config: &AuditConfig,
) -> RoleSwapVerifier {
    let index = ProjectIndex::build(dir.path(), true).expect("index");
    let toolkit = Arc::new(AgentToolkit::new(Arc::new(index)));
    let verifier = Arc::new(VerifierAgent::new(
        LlmSettings::default(),
        provider,
        toolkit.clone(),
        CancelToken::new(),
    ));
    RoleSwapVerifier::new(verifier, toolkit, config, CancelToken::new())
}

/// Handler that answers group-verification prompts with one result per
/// finding, keyed on keywords in the finding block.
fn keyword_group_handler(messages: &[moveaudit::llm::ChatMessage]) -> moveaudit::error::Result<moveaudit::llm::ChatResponse> {
    let text = request_text(messages);
    let mut results = Vec::new();
    for index in 1..=20 {
        let marker = format!("### Finding [{index}]: ");
        let Some(pos) = text.find(&marker) else { break };
        let block: String = text[pos..].chars().take(900).collect();

        let (conclusion, severity, mechanism) = if block.contains("no enforced repayment") {
            ("false_positive", "none", "hot_potato")
        } else if block.contains("missing access control") && block.contains("set_admin") {
            ("false_positive", "none", "capability access control")
        } else if block.contains("add_role") {
            ("false_positive", "none", "layered design: all callers hold AdminCap")
        } else if block.contains("repaid type") {
            ("confirmed", "critical", "")
        } else {
            ("confirmed", "high", "")
        };

        results.push(serde_json::json!({
            "vuln_index": index,
            "conclusion": conclusion,
            "confidence": 90,
            "final_severity": severity,
            "security_mechanism_covered": conclusion == "false_positive",
            "mechanism_name": mechanism,
            "reasoning": format!("mechanism: {mechanism}"),
        }));
    }
    Ok(MockProvider::response(
        serde_json::json!({ "results": results }).to_string(),
    ))
}

#[tokio::test]
async fn hot_potato_pattern_is_recognised_as_safe() {
    let dir = write_project(&[("flash.move", FLASH_SAFE_MODULE)]);
    let provider = Arc::new(MockProvider::new(keyword_group_handler));
    let pipeline = pipeline(&dir, provider, &AuditConfig::default());

    let raw = vec![finding(
        "V-1",
        "Flashloan has no enforced repayment",
        "flashloan",
        "demo::flash",
        "borrow",
    )];
    let (verified, _) = pipeline.batch_verify(raw).await.unwrap();

    assert_eq!(verified.len(), 1);
    assert_eq!(
        verified[0].verification_status,
        VerificationStatus::FalsePositive
    );
    assert_eq!(verified[0].final_severity, Severity::None);
    assert_eq!(
        verified[0].verifier_result["mechanism_name"],
        "hot_potato"
    );
    // the exclusion rules annotated the finding on the way in
    assert_eq!(
        verified[0]
            .original_finding
            .soft_filter_hint
            .as_ref()
            .unwrap()
            .rule_name,
        "hot_potato_enforcement"
    );
}

#[tokio::test]
async fn type_confusion_survives_filtering_and_is_confirmed() {
    let dir = write_project(&[("flash.move", FLASH_SAFE_MODULE)]);
    let provider = Arc::new(MockProvider::new(keyword_group_handler));
    let pipeline = pipeline(&dir, provider, &AuditConfig::default());

    let raw = vec![finding(
        "V-2",
        "repay never compares the repaid type with the borrowed one",
        "type_confusion",
        "demo::flash",
        "repay",
    )];
    let (verified, _) = pipeline.batch_verify(raw).await.unwrap();

    // no exclusion rule may touch this class of finding
    assert!(verified[0].original_finding.soft_filter_hint.is_none());
    assert_eq!(
        verified[0].verification_status,
        VerificationStatus::Confirmed
    );
    assert!(matches!(
        verified[0].final_severity,
        Severity::High | Severity::Critical
    ));
}

#[tokio::test]
async fn capability_protected_admin_function_is_false_positive() {
    let dir = write_project(&[(
        "config.move",
        r#"
module demo::config {
    public fun set_admin(_: &AdminCap, config: &mut Config, admin: address) {
        config.admin = admin;
    }
}
"#,
    )]);
    let provider = Arc::new(MockProvider::new(keyword_group_handler));
    let pipeline = pipeline(&dir, provider, &AuditConfig::default());

    let mut raw = finding(
        "V-3",
        "missing access control in set_admin",
        "access_control",
        "demo::config",
        "set_admin",
    );
    raw.evidence = "public fun set_admin(_: &AdminCap, config: &mut Config, admin: address)".into();
    let (verified, _) = pipeline.batch_verify(vec![raw]).await.unwrap();

    assert_eq!(
        verified[0].verification_status,
        VerificationStatus::FalsePositive
    );
    assert_eq!(verified[0].final_severity, Severity::None);
    let mechanism = verified[0].verifier_result["mechanism_name"]
        .as_str()
        .unwrap();
    assert!(mechanism.contains("capability"));
}

#[tokio::test]
async fn layered_design_uses_caller_signatures_from_shared_context() {
    let dir = write_project(ACL_MODULES);
    let provider = Arc::new(MockProvider::new(keyword_group_handler));
    let pipeline = pipeline(&dir, provider.clone(), &AuditConfig::default());

    let mut raw = finding(
        "V-4",
        "add_role has no permission check",
        "access_control",
        "demo::acl",
        "add_role",
    );
    // Phase 2 recorded the caller signatures
    raw.phase2_func_context = Some(FunctionContextSnapshot {
        function_code: "public fun add_role(acl: &mut Acl, member: address, role: u8) { ... }"
            .into(),
        caller_signatures: vec![
            "public fun add_role(_: &AdminCap, acl: &mut Acl, member: address, role: u8)".into(),
        ],
        callee_signatures: vec![],
    });

    let (verified, stats) = pipeline.batch_verify(vec![raw]).await.unwrap();
    assert_eq!(
        verified[0].verification_status,
        VerificationStatus::FalsePositive
    );
    let reasoning = verified[0].verifier_result["reasoning"].as_str().unwrap();
    assert!(reasoning.contains("AdminCap"));
    // the phase-2 snapshot was the code source
    assert_eq!(stats.from_phase2, 1);

    // and the caller signatures were embedded in the verification prompt
    let prompts = provider.seen_prompts.lock().unwrap();
    assert!(prompts
        .iter()
        .any(|p| p.contains("layered") && p.contains("_: &AdminCap")));
}

#[tokio::test]
async fn one_verified_finding_per_input_in_input_order() {
    let dir = write_project(ACL_MODULES);
    let provider = Arc::new(MockProvider::new(keyword_group_handler));
    let mut config = AuditConfig::default();
    config.group_size = 2;
    let pipeline = pipeline(&dir, provider, &config);

    let raw: Vec<Finding> = (0..7)
        .map(|i| {
            let module = if i % 2 == 0 { "demo::acl" } else { "demo::config" };
            finding(&format!("V-{i}"), &format!("issue number {i}"), "logic", module, "f")
        })
        .collect();
    let input_ids: Vec<String> = raw.iter().map(|f| f.id.clone()).collect();

    let (verified, _) = pipeline.batch_verify(raw).await.unwrap();
    assert_eq!(verified.len(), 7);
    let output_ids: Vec<String> = verified
        .iter()
        .map(|v| v.original_finding.id.clone())
        .collect();
    assert_eq!(output_ids, input_ids);
}

#[tokio::test]
async fn failed_group_yields_needs_review_never_drops() {
    let dir = write_project(ACL_MODULES);
    let provider = Arc::new(MockProvider::new(|_messages| {
        Err(AuditError::llm_api("backend exploded"))
    }));
    let pipeline = pipeline(&dir, provider, &AuditConfig::default());

    let raw = vec![
        finding("V-1", "a", "logic", "demo::acl", "add_role"),
        finding("V-2", "b", "logic", "demo::acl", "add_role"),
    ];
    let (verified, _) = pipeline.batch_verify(raw).await.unwrap();

    assert_eq!(verified.len(), 2);
    for v in &verified {
        assert_eq!(v.verification_status, VerificationStatus::NeedsReview);
        assert!(v.recommendations[0].contains("error"));
    }
}

#[tokio::test]
async fn per_finding_mode_also_preserves_inputs() {
    let dir = write_project(ACL_MODULES);
    // per-finding mode: verifier answers a single-object verdict
    let provider = Arc::new(MockProvider::new(|_messages| {
        Ok(MockProvider::response(
            serde_json::json!({
                "conclusion": "false_positive",
                "confidence": 92,
                "final_severity": "none",
                "mechanism_name": "layered design",
                "reasoning": "callers hold the capability",
            })
            .to_string(),
        ))
    }));
    let mut config = AuditConfig::default();
    config.use_group_verify = false;
    let pipeline = pipeline(&dir, provider, &config);

    let raw = vec![
        finding("V-1", "a", "logic", "demo::acl", "add_role"),
        finding("V-2", "b", "logic", "demo::config", "add_role"),
    ];
    let (verified, _) = pipeline.batch_verify(raw).await.unwrap();
    assert_eq!(verified.len(), 2);
    assert!(verified
        .iter()
        .all(|v| v.verification_status == VerificationStatus::FalsePositive));
}
