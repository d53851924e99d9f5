//! Exclusion rules engine
//!
//! A deterministic, ordered list of rules that tag raw findings with an
//! advisory `SoftFilterHint`. Rules never drop findings: only an LLM
//! verdict can reclassify one. The first matching rule attaches its hint
//! and evaluation stops for that finding.
//!
//! Rule families: language-level protection, access control, resource
//! safety, design patterns, code quality, DeFi specifics, and semantic
//! signals (speculative phrasing, commented-out code).

use tracing::debug;

use crate::types::{Finding, SoftFilterHint};

/// One deterministic rule: pure function of the finding text
pub struct ExclusionRule {
    pub name: &'static str,
    check: fn(&RuleInput) -> Option<String>,
    hint_for_ai: &'static str,
}

/// Pre-lowered views of the finding, shared by all rules
pub struct RuleInput {
    evidence: String,
    function: String,
    /// title + category + description
    text: String,
    /// everything including evidence
    all: String,
}

impl RuleInput {
    fn new(finding: &Finding) -> Self {
        let title = finding.title.to_lowercase();
        let description = finding.description.to_lowercase();
        let category = finding.category.to_lowercase();
        let evidence = finding.evidence.to_lowercase();
        let text = format!("{title} {category} {description}");
        let all = format!("{text} {evidence}");
        Self {
            evidence,
            function: finding.location.function.to_lowercase(),
            text,
            all,
        }
    }

    fn text_has(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.text.contains(k))
    }

    fn any_has(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.all.contains(k))
    }
}

/// Apply the rules to every finding, in order, attaching at most one hint
/// per finding. The returned list has exactly the same length and order as
/// the input.
pub fn apply_exclusion_rules(findings: Vec<Finding>) -> Vec<Finding> {
    let rules = rules();
    findings
        .into_iter()
        .map(|mut finding| {
            if finding.soft_filter_hint.is_none() {
                let input = RuleInput::new(&finding);
                for rule in &rules {
                    if let Some(reason) = (rule.check)(&input) {
                        debug!(rule = rule.name, finding = %finding.id, "soft-filter hint attached");
                        finding.soft_filter_hint = Some(SoftFilterHint {
                            rule_name: rule.name.to_string(),
                            reason,
                            hint_for_ai: rule.hint_for_ai.to_string(),
                        });
                        break;
                    }
                }
            }
            finding
        })
        .collect()
}

/// Number of registered rules (stable API for stats/tests)
pub fn rule_count() -> usize {
    rules().len()
}

macro_rules! rule {
    ($name:literal, $hint:literal, $check:expr) => {
        ExclusionRule {
            name: $name,
            check: $check,
            hint_for_ai: $hint,
        }
    };
}

#[allow(clippy::too_many_lines)]
fn rules() -> Vec<ExclusionRule> {
    vec![
        // ------------------------------------------------------------------
        // Language-level protection
        // ------------------------------------------------------------------
        rule!(
            "move_overflow_abort",
            "Verify the operation is +,-,*,/ (VM aborts on overflow). Bit shifts are NOT protected; confirm none are involved before dismissing.",
            |input| {
                if input.text_has(&["overflow", "underflow"])
                    && !input.any_has(&["<<", ">>", "shift", "shl", "shr"])
                {
                    Some("arithmetic overflow on +,-,*,/ aborts the transaction at the VM level".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "vector_bounds_abort",
            "Vector primitives abort on bad indices. Check only whether a forced abort on a shared object enables griefing.",
            |input| {
                if input.text_has(&["out of bounds", "out-of-bounds", "index out of range"]) {
                    Some("vector access aborts on out-of-range indices".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "no_reentrancy",
            "Move has no dynamic dispatch; confirm the claim actually requires re-entering a module mid-call before dismissing.",
            |input| {
                if input.text_has(&["reentrancy", "reentrant", "re-entrancy"]) {
                    Some("no dynamic dispatch: classic reentrancy cannot occur in Move".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "division_by_zero_abort",
            "Division by zero aborts the transaction; check for griefing potential only.",
            |input| {
                if input.text_has(&["division by zero", "divide by zero", "div by zero"]) {
                    Some("division by zero aborts at the VM level".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "init_runtime_protection",
            "A module init function runs once at publish, invoked by the runtime; external callers cannot reach it.",
            |input| {
                (input.function == "init"
                    && input.text_has(&["caller", "unauthorized", "anyone", "access"]))
                .then(|| "init() is invoked once by the runtime at publish time".to_string())
            }
        ),
        rule!(
            "resource_forgery_impossible",
            "Struct values can only be constructed inside their defining module; forging is impossible. Check instead whether a public constructor leaks.",
            |input| {
                if input.text_has(&["forge", "forged", "fake object", "fabricate", "counterfeit"]) {
                    Some("the type system prevents constructing structs outside their module".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "type_name_collision_impossible",
            "type_name includes the full address::module path; two different types cannot collide.",
            |input| {
                if input.text_has(&["type name collision", "name collision", "same type name"]) {
                    Some("type_name is fully qualified; collisions between distinct types are impossible".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "compile_time_type_name",
            "type_name::get is resolved at compile time; users cannot influence it.",
            |input| {
                if input.text_has(&["manipulate type_name", "spoof type", "control the type name"]) {
                    Some("type_name::get values are fixed at compile time".into())
                } else {
                    None
                }
            }
        ),
        // ------------------------------------------------------------------
        // Access control
        // ------------------------------------------------------------------
        rule!(
            "capability_parameter",
            "A `&XxxCap` parameter is the access check; the runtime proves ownership. `_` as a name does not mean unused.",
            |input| {
                if input.text_has(&["access control", "no permission", "missing permission", "unauthorized", "anyone can"])
                    && input.any_has(&["admincap", "ownercap", "&cap", "cap)", "cap,", "_: &"])
                {
                    Some("a capability-typed parameter enforces authorisation at the runtime level".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "package_visibility",
            "public(package)/public(friend)/private functions cannot be called from external modules.",
            |input| {
                if input.text_has(&["access control", "no permission", "unauthorized", "missing check", "anyone can"])
                    && input.any_has(&["public(package)", "public(friend)", "private function", "friend fun"])
                {
                    Some("restricted visibility already prevents external invocation".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "publisher_pattern",
            "A Publisher object proves package-publisher identity; holding it is privileged by construction.",
            |input| {
                if input.any_has(&["publisher"]) && input.text_has(&["access control", "unauthorized", "anyone"]) {
                    Some("the Publisher object is only obtainable by the package publisher".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "getter_no_acl_needed",
            "Read-only getters expose no privileged mutation; on-chain data is public anyway.",
            |input| {
                ((input.function.starts_with("get_")
                    || input.function.starts_with("is_")
                    || input.function.starts_with("has_")
                    || input.text_has(&["getter", "read-only function", "view function"]))
                    && input.text_has(&["access control", "permission", "unauthorized", "exposes", "leak"]))
                .then(|| "read-only getters need no access control; chain state is public".to_string())
            }
        ),
        rule!(
            "object_ownership_proof",
            "Passing an owned object (&T / &mut T / T) proves the sender owns it; no extra assertion needed.",
            |input| {
                if input.text_has(&["not verify the owner", "ownership check", "anyone's position", "other users' position"])
                    && input.any_has(&["&mut position", "&position", "&mut account", "owned object"])
                {
                    Some("owned-object parameters imply runtime ownership verification".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "layered_wrapper_protection",
            "Check the caller signatures: an internal function whose callers all demand a capability is protected by layering.",
            |input| {
                ((input.function.ends_with("_internal") || input.any_has(&["_internal", "wrapper"]))
                    && input.text_has(&["access control", "permission", "unauthorized"]))
                .then(|| "internal helpers are commonly guarded by their wrappers; inspect callers".to_string())
            }
        ),
        // ------------------------------------------------------------------
        // Resource safety
        // ------------------------------------------------------------------
        rule!(
            "linear_type_consumption",
            "Values without drop must be consumed; leaks of such resources cannot compile.",
            |input| {
                if input.text_has(&["resource leak", "leaked resource", "not consumed", "forgotten resource"]) {
                    Some("linear types force consumption; leaking is a compile error".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "borrow_checker_lifetime",
            "Use-after-free / double-free cannot pass the bytecode verifier; only logical double-counting in storage is possible.",
            |input| {
                if input.text_has(&["use after free", "use-after-free", "double free", "dangling reference"]) {
                    Some("the bytecode verifier rules out lifetime violations".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "copy_drop_protection",
            "Without the copy ability a value cannot be duplicated; check whether the claim needs copying.",
            |input| {
                if input.text_has(&["duplicate the", "duplicated coin", "copy the resource", "clone the"])
                    && !input.text_has(&["storage", "record", "accounting"])
                {
                    Some("missing copy ability prevents value duplication".into())
                } else {
                    None
                }
            }
        ),
        // ------------------------------------------------------------------
        // Design patterns
        // ------------------------------------------------------------------
        rule!(
            "hot_potato_enforcement",
            "A receipt struct with no abilities forces same-transaction consumption; repayment is enforced by the language. Still verify the repay function checks type equality and amount.",
            |input| {
                if input.text_has(&["flashloan", "flash loan"])
                    && input.text_has(&["no enforced", "not enforced", "without repay", "skip repay", "never repaid", "no repayment"])
                {
                    Some("an ability-less receipt (hot potato) makes repayment mandatory".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "flashloan_permissionless",
            "Flash loans are permissionless by design; borrowing requires no identity.",
            |input| {
                if input.text_has(&["flashloan", "flash loan"])
                    && input.text_has(&["caller verification", "anyone can borrow", "no identity"])
                {
                    Some("permissionless borrowing is the flash-loan design, not a flaw".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "shared_object_by_design",
            "Shared objects are globally accessible by design; look for missing checks on mutating paths instead.",
            |input| {
                if input.text_has(&["anyone can access the shared", "shared object is public", "global object accessible"]) {
                    Some("shared objects are meant to be accessible; safety lives in the mutation checks".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "default_allow_listing",
            "`allowed = in_allowlist || !in_denylist` is the default-allow/explicit-deny policy used by permissionless protocols.",
            |input| {
                if input.any_has(&["allowlist", "denylist", "whitelist", "blacklist"])
                    && input.text_has(&["logic error", "inconsisten", "bypass the list"])
                {
                    Some("default-allow with explicit deny is an intentional listing policy".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "display_transfer_pattern",
            "Transferring a display/receipt object to the user is the standard pattern, not an asset leak.",
            |input| {
                if input.text_has(&["transfers the object to", "sends the nft", "display object"])
                    && input.text_has(&["leak", "loses", "steal"])
                {
                    Some("transferring display objects to users is the intended flow".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "version_gate_is_protection",
            "`version >= previous` checks protect against stale-package calls; the monotone bump is deliberate.",
            |input| {
                if input.any_has(&["version"])
                    && input.text_has(&["version check", "version can only increase", "cannot downgrade"])
                {
                    Some("monotone version gating is a protective pattern".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "defense_in_depth",
            "A redundant second check is defense in depth; redundancy is not a defect.",
            |input| {
                if input.text_has(&["redundant check", "double check", "checked twice", "duplicate assertion"]) {
                    Some("redundant assertions are deliberate layered protection".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "atomic_transaction_rollback",
            "A failed Move transaction rolls back entirely; partial-state inconsistency across a single call cannot persist.",
            |input| {
                if input.text_has(&["state inconsistency", "partial update", "partially updated", "inconsistent state if"])
                    && input.text_has(&["fail", "abort", "revert", "error"])
                {
                    Some("transactions are atomic; an abort leaves no partial state".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "intentional_zero_assertion",
            "Asserting a value is exactly zero is usually an intentional invariant, not a missing check.",
            |input| {
                if input.any_has(&["== 0"])
                    && input.text_has(&["assert", "requires zero", "must be zero"])
                    && input.text_has(&["unnecessary", "blocks", "prevents legitimate"])
                {
                    Some("zero-value assertions encode a deliberate invariant".into())
                } else {
                    None
                }
            }
        ),
        // ------------------------------------------------------------------
        // Code quality vs security
        // ------------------------------------------------------------------
        rule!(
            "test_only_code",
            "#[test_only] items are stripped from production builds.",
            |input| {
                if input.any_has(&["#[test_only]", "test_only", "test-only"]) {
                    Some("test-only code is excluded from on-chain builds".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "deprecated_code",
            "Deprecated or unused functions need removal, not a security rating.",
            |input| {
                if input.text_has(&["deprecated", "unused function", "dead code"]) {
                    Some("dead/deprecated code is a maintenance issue, not a vulnerability".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "commented_out_code",
            "Commented-out code does not execute; it cannot be a runtime vulnerability.",
            |input| {
                if input.text_has(&["commented out", "commented-out", "disabled code", "code in comments"]) {
                    Some("commented-out code has no runtime effect".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "naming_issue",
            "Typos and naming inconsistencies are quality issues without an attack vector.",
            |input| {
                if input.text_has(&["typo", "misspell", "naming inconsistency", "misleading name"])
                    && !input.text_has(&["wrong variable", "wrong field"])
                {
                    Some("naming problems carry no attack vector".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "loop_optimisation",
            "Gas/loop inefficiency is a quality concern unless an attacker can force unbounded work.",
            |input| {
                if input.text_has(&["gas", "inefficien", "loop optimization", "redundant computation"])
                    && !input.text_has(&["unbounded", "attacker can grow", "denial of service"])
                {
                    Some("inefficiency without attacker-controlled growth is not a vulnerability".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "precision_truncation",
            "Range-checked narrowing casts lose precision, not funds; fixed-point systems round by design. Check who absorbs the rounding.",
            |input| {
                if input.text_has(&["precision loss", "truncation", "rounding", "precision is lost"])
                    && !input.text_has(&["attacker profits", "drain", "steal", "accumulate the difference"])
                {
                    Some("bounded precision loss is a mathematical property of fixed-point math".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "rounding_favors_protocol",
            "Rounding up amounts owed to the protocol is the safe direction; it is a design choice.",
            |input| {
                if input.text_has(&["rounds up", "round up", "ceiling division"])
                    && input.text_has(&["unfair", "overcharge", "takes more"])
                {
                    Some("rounding in the protocol's favour protects solvency".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "chain_data_public",
            "All on-chain state is publicly readable; exposing it is not an information leak.",
            |input| {
                if input.text_has(&["information leak", "exposes sensitive", "information disclosure", "reveals the"])
                    && !input.text_has(&["private key", "secret key", "seed"])
                {
                    Some("blockchain state is public by nature; reads reveal nothing new".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "invalid_finding_shape",
            "A finding without a concrete location or code cannot be acted on; treat as reporting noise.",
            |input| {
                if input.all.contains("n/a")
                    && (input.function.is_empty() || input.evidence.trim().is_empty())
                {
                    Some("the finding carries no location or code evidence".into())
                } else {
                    None
                }
            }
        ),
        // ------------------------------------------------------------------
        // DeFi specifics
        // ------------------------------------------------------------------
        rule!(
            "user_chosen_slippage",
            "Slippage bounds (min_out, sqrt_price_limit) are user-supplied protection; a user choosing zero accepts the risk.",
            |input| {
                if input.any_has(&["slippage", "min_amount_out", "minimum output", "sqrt_price_limit", "price limit"])
                    && input.text_has(&["no slippage", "slippage check", "sandwich", "user can set"])
                {
                    Some("slippage limits are caller-chosen parameters; the user owns that risk".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "fee_growth_wrapping",
            "Global fee-growth accumulators wrap by design (as in concentrated-liquidity math); differences stay correct modulo 2^n.",
            |input| {
                if input.any_has(&["fee_growth", "fee growth"])
                    && input.text_has(&["overflow", "wrap", "wraps around"])
                {
                    Some("fee-growth accumulators are designed to wrap; deltas remain correct".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "admin_business_decision",
            "Parameter ranges behind an admin capability are business decisions; the capability is the safeguard.",
            |input| {
                if input.any_has(&["admincap", "ownercap", "admin role", "only admin"])
                    && input.text_has(&["fee too high", "parameter range", "no upper bound", "arbitrary value", "any value"])
                {
                    Some("value ranges guarded by an admin capability are governance decisions".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "admin_input_validation",
            "Formats supplied by the admin (URLs, metadata) need no on-chain validation; the admin is trusted for them.",
            |input| {
                if input.text_has(&["url format", "metadata format", "invalid url", "unvalidated string"])
                    && input.any_has(&["admin", "cap"])
                {
                    Some("admin-supplied metadata is trusted input".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "admin_operation_replay",
            "Re-running an admin operation (multiple mints with a held cap) is capability misuse, not an exploit by outsiders.",
            |input| {
                if input.text_has(&["replay", "called multiple times", "repeatedly call"])
                    && input.any_has(&["admin", "mint_cap", "treasurycap", "cap"])
                {
                    Some("repeating privileged calls requires the capability; outsiders cannot".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "source_validated_parameter",
            "Parameters validated where they are created (e.g. fee rate at partner creation) need no re-validation downstream.",
            |input| {
                if input.text_has(&["not validated", "no validation", "unchecked parameter"])
                    && input.text_has(&["already validated", "validated at creation", "checked when created", "fee_rate"])
                {
                    Some("the value is range-checked at its source; downstream re-checks are redundant".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "governance_timing",
            "Immediate parameter updates vs timelocks are a governance design choice.",
            |input| {
                if input.text_has(&["timelock", "no delay", "immediately effective", "instant update"])
                    && input.any_has(&["admin", "governance", "config"])
                {
                    Some("update timing is a governance decision, not a code defect".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "rate_limit_governance",
            "Missing frequency limits on privileged operations are governance matters when a role check exists.",
            |input| {
                if input.text_has(&["rate limit", "no cooldown", "frequency limit", "too frequently"])
                    && input.any_has(&["role", "cap", "admin"])
                {
                    Some("frequency control behind a role check is a governance choice".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "dynamic_field_internal_state",
            "Pending/internal bookkeeping in dynamic fields is module-private state; external code cannot touch it.",
            |input| {
                if input.any_has(&["dynamic_field", "dynamic field"])
                    && input.text_has(&["manipulate", "tamper", "modify the pending", "internal state"])
                {
                    Some("dynamic fields are only reachable through the owning module's API".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "state_field_semantics",
            "The meaning of a state flag (is_pause polarity etc.) is defined by the developer; an unusual choice is not a bug by itself.",
            |input| {
                if input.text_has(&["flag semantics", "inverted flag", "confusing flag", "pause flag meaning"]) {
                    Some("flag semantics are a design definition; verify actual misuse before confirming".into())
                } else {
                    None
                }
            }
        ),
        // ------------------------------------------------------------------
        // Semantic signals
        // ------------------------------------------------------------------
        rule!(
            "speculative_phrasing",
            "Findings hedged with 'if the implementation', 'possibly', 'not shown here' guess at unseen code; demand concrete evidence.",
            |input| {
                if input.text_has(&[
                    "if the implementation",
                    "assuming the",
                    "might be",
                    "could potentially",
                    "not shown",
                    "presumably",
                    "virtualy",
                    "virtually certain",
                ]) {
                    Some("the description is speculative rather than evidenced".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "design_choice_not_vuln",
            "Fee splits, reward ratios and priority orders are business decisions; a vulnerability needs a broken invariant.",
            |input| {
                if input.text_has(&["design choice", "fee distribution", "reward ratio", "allocation percentage", "incentive"])
                    && !input.text_has(&["steal", "drain", "bypass"])
                {
                    Some("economic parameters are protocol design, not a safety defect".into())
                } else {
                    None
                }
            }
        ),
        rule!(
            "defensive_abort",
            "Aborting on invalid input is protection; a transaction failure for bad input is intended.",
            |input| {
                if input.text_has(&["will abort", "causes abort", "transaction fails", "revert"])
                    && input.text_has(&["denial", "blocks the user", "prevents the call"])
                    && !input.text_has(&["shared", "grief", "lock funds", "permanently"])
                {
                    Some("aborting on invalid input is the defensive path, not a flaw".into())
                } else {
                    None
                }
            }
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Location, Severity};

    fn finding(title: &str, category: &str, description: &str, evidence: &str) -> Finding {
        Finding {
            id: "R-1".into(),
            title: title.into(),
            severity: Severity::High,
            category: category.into(),
            location: Location::new("demo::pool", "withdraw"),
            description: description.into(),
            evidence: evidence.into(),
            attack_scenario: None,
            recommendation: None,
            confidence: 60,
            phase2_context: None,
            phase2_func_context: None,
            module_name: None,
            soft_filter_hint: None,
        }
    }

    #[test]
    fn rules_never_change_finding_count() {
        let findings = vec![
            finding("Integer overflow in add", "overflow", "a + b may overflow", "a + b"),
            finding("Missing access control", "access_control", "anyone can call", ""),
            finding("Weird unmatched thing", "other", "nothing matches here", ""),
        ];
        let before = findings.len();
        let after = apply_exclusion_rules(findings);
        assert_eq!(after.len(), before);
    }

    #[test]
    fn overflow_gets_hint_but_shift_does_not() {
        let plain = apply_exclusion_rules(vec![finding(
            "Integer overflow",
            "overflow",
            "the addition a + b may overflow",
            "a + b",
        )]);
        assert_eq!(
            plain[0].soft_filter_hint.as_ref().unwrap().rule_name,
            "move_overflow_abort"
        );

        let shift = apply_exclusion_rules(vec![finding(
            "Shift overflow",
            "overflow",
            "the left shift a << 64 silently drops bits",
            "a << 64",
        )]);
        assert!(shift[0]
            .soft_filter_hint
            .as_ref()
            .map(|h| h.rule_name != "move_overflow_abort")
            .unwrap_or(true));
    }

    #[test]
    fn capability_parameter_is_hinted() {
        let out = apply_exclusion_rules(vec![finding(
            "Missing access control in set_admin",
            "access_control",
            "anyone can call set_admin because the AdminCap parameter named _ is unused",
            "public fun set_admin(_: &AdminCap, config: &mut Config)",
        )]);
        assert_eq!(
            out[0].soft_filter_hint.as_ref().unwrap().rule_name,
            "capability_parameter"
        );
    }

    #[test]
    fn hot_potato_flashloan_is_hinted() {
        let out = apply_exclusion_rules(vec![finding(
            "Flashloan has no enforced repayment",
            "flashloan",
            "borrow hands out funds and repayment is not enforced",
            "struct FlashReceipt { amount: u64 }",
        )]);
        assert_eq!(
            out[0].soft_filter_hint.as_ref().unwrap().rule_name,
            "hot_potato_enforcement"
        );
    }

    #[test]
    fn type_confusion_is_not_filtered() {
        // The type-equality class of bug must survive every rule untouched.
        let out = apply_exclusion_rules(vec![finding(
            "Repay does not verify borrowed type",
            "type_confusion",
            "repay only checks contains_type<A>(pool) and never compares the repaid type with the receipt type",
            "assert!(contains_type<A>(pool), 0);",
        )]);
        assert!(out[0].soft_filter_hint.is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let out = apply_exclusion_rules(vec![finding(
            "Overflow in deprecated helper",
            "overflow",
            "the deprecated helper may overflow when adding",
            "",
        )]);
        // move_overflow_abort is registered before deprecated_code
        assert_eq!(
            out[0].soft_filter_hint.as_ref().unwrap().rule_name,
            "move_overflow_abort"
        );
    }

    #[test]
    fn rule_inventory_is_large() {
        assert!(rule_count() >= 40, "expected a broad rule set, got {}", rule_count());
    }
}
