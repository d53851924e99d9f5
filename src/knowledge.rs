//! Move security mechanism knowledge base
//!
//! Static, curated knowledge injected into verifier prompts and served
//! through the `query_security_knowledge` tool. Every entry carries a
//! judgment flow ("check the code before concluding") and the cases where
//! the mechanism does NOT apply and the finding stays real, so the model
//! cannot wave a finding away just because a mechanism exists.

use once_cell::sync::Lazy;

use crate::types::Finding;

/// One knowledge topic
#[derive(Debug, Clone)]
pub struct KnowledgeTopic {
    pub key: &'static str,
    pub title: &'static str,
    pub aliases: &'static [&'static str],
    /// Keywords matched against finding title/category/description
    pub match_keywords: &'static [&'static str],
    pub content: &'static str,
}

/// The full topic list. Order matters only for display.
pub static TOPICS: Lazy<Vec<KnowledgeTopic>> = Lazy::new(|| {
    vec![
        KnowledgeTopic {
            key: "operators",
            title: "Operator confusion: comparison vs shift",
            aliases: &["comparison", "shift_confusion"],
            match_keywords: &["operator", "comparison", "<<", ">>"],
            content: "`<` is a comparison; `<<` is a shift. Findings that quote `<` but reason \
about shifts (or vice versa) usually misread the code.\n\
Judgment flow: read the exact operator in the quoted line, then decide.\n\
Still a real vulnerability when: the code genuinely uses `<<`/`>>` - shifts are NOT \
covered by the VM's arithmetic abort and can silently lose high bits.",
        },
        KnowledgeTopic {
            key: "overflow",
            title: "Arithmetic overflow protection",
            aliases: &["underflow", "arithmetic"],
            match_keywords: &["overflow", "underflow", "arithmetic", "addition", "subtraction", "multiplication"],
            content: "The Move VM aborts the whole transaction on +, -, * or / overflow and \
on division by zero. \"Integer overflow in add/sub/mul\" findings are normally false \
positives: the transaction fails, no corrupted state persists.\n\
Judgment flow: (1) confirm the operation is +,-,*,/; (2) check for `<<` or `>>` nearby; \
(3) check whether an abort here can be used for griefing a shared resource.\n\
Still a real vulnerability when: the operation is a bit shift (no protection); the \
developer truncates with `as u64`-style casts after widening; or an attacker can force \
aborts to block other users (denial of service on a shared object).",
        },
        KnowledgeTopic {
            key: "reentrancy",
            title: "Reentrancy immunity",
            aliases: &["reentrant"],
            match_keywords: &["reentrancy", "reentrant", "re-entry", "callback"],
            content: "Move has no dynamic dispatch and no fallback functions; a callee is fixed \
at compile time, so the EVM-style reentrancy pattern cannot occur.\n\
Judgment flow: check whether the claimed attack actually requires re-entering the \
calling module mid-execution; in Move it cannot.\n\
Still a real vulnerability when: the finding is really about state ordering within one \
call (check-then-update inside the same function can still be wrong logic), or about a \
multi-transaction sequence - neither of those is reentrancy protection's concern.",
        },
        KnowledgeTopic {
            key: "type_safety",
            title: "Generic type-system safety",
            aliases: &["generics", "type_confusion"],
            match_keywords: &["type confusion", "generic", "type parameter", "type check", "type mismatch"],
            content: "Move generics are checked at compile time, and `type_name::get<T>()` \
produces the full module-qualified name; an attacker cannot forge a type.\n\
Judgment flow: (1) find where the type parameter enters; (2) check whether the code \
compares the stored type against the supplied one (e.g. \
`assert!(type_name::get<A>() == receipt.type_name)`); (3) a mere `contains_type<A>(pool)` \
membership check does NOT prove the repaid type equals the borrowed type.\n\
Still a real vulnerability when: the developer forgot the equality check - borrowing \
asset A and repaying cheaper asset B both present in the pool is a classic type-confusion \
bug and MUST be confirmed.",
        },
        KnowledgeTopic {
            key: "capability",
            title: "Capability-based access control",
            aliases: &["access_control", "admin_cap", "cap"],
            match_keywords: &["access control", "permission", "unauthorized", "admin", "capability", "cap"],
            content: "A parameter of a capability type (e.g. `_: &AdminCap`) IS the access \
check: the caller must own the object to produce the reference, enforced by the runtime. \
An underscore parameter name does not mean the check is missing.\n\
Judgment flow: (1) look at the parameter list for `&XxxCap`; (2) if absent, look at every \
caller - a private/package function whose callers all demand a capability is protected by \
layering; (3) only conclude \"missing access control\" when no path requires one.\n\
Still a real vulnerability when: a public/entry function mutates privileged state and \
neither it nor any caller takes a capability; or the capability is transferable/mintable \
by unprivileged code.",
        },
        KnowledgeTopic {
            key: "layered_design",
            title: "Layered design: low-level module guarded by callers",
            aliases: &["layering", "internal_module"],
            match_keywords: &["no permission check", "internal function", "low-level", "acl", "helper"],
            content: "Projects commonly keep permission checks in a top config/admin module \
and leave the low-level module (acl, math, storage) check-free. The low-level function is \
safe when every caller requires a capability.\n\
Judgment flow: (1) list the callers (their signatures are the key signal); (2) check \
each caller's parameter list for capabilities; (3) check the low-level function's \
visibility - `public(package)`/`public(friend)`/private cannot be reached externally.\n\
Still a real vulnerability when: the low-level function is `public` or `entry` AND at \
least one reachable path performs no check.",
        },
        KnowledgeTopic {
            key: "hot_potato",
            title: "Hot-potato enforcement",
            aliases: &["hotpotato", "flash_loan_receipt", "linear"],
            match_keywords: &["flashloan", "flash loan", "repayment", "receipt", "hot potato", "forced"],
            content: "A struct with NO abilities (no copy/drop/store/key) cannot be stored or \
discarded; the language forces the holder to consume it in the same transaction. A flash \
loan returning such a receipt has enforced repayment - \"no enforced repayment\" findings \
against that shape are false positives.\n\
Judgment flow: (1) read the receipt struct declaration and confirm the absence of \
abilities; (2) read the repay function: does it assert the repaid asset type equals the \
recorded one, the amount, and the pool identity?\n\
Still a real vulnerability when: the receipt has `drop` (repayment skippable); or repay \
validates membership only (`contains_type`) instead of equality - the type-confusion case \
remains real even with a perfect hot potato.",
        },
        KnowledgeTopic {
            key: "init_protection",
            title: "init() runtime protection",
            aliases: &["module_init", "one_time_witness"],
            match_keywords: &["init", "initialization", "initializer"],
            content: "A module's `init` function runs exactly once, at publish time, invoked by \
the runtime. External users cannot call it; \"init lacks caller verification\" is a false \
positive.\n\
Judgment flow: confirm the function is literally named `init` with the module-init \
signature; a public function named `initialize` is NOT protected.\n\
Still a real vulnerability when: a separate public initialization entry can be re-run to \
reset privileged state.",
        },
        KnowledgeTopic {
            key: "private_function",
            title: "Function visibility protection",
            aliases: &["visibility", "friend", "package_visibility"],
            match_keywords: &["private function", "visibility", "public(package)", "public(friend)", "internal"],
            content: "`private`, `public(package)` and `public(friend)` functions cannot be \
called from arbitrary external modules; findings assuming external invocation of such \
functions are false positives.\n\
Judgment flow: read the declared visibility, then check whether any `public`/`entry` \
wrapper exposes the same behaviour without checks.\n\
Still a real vulnerability when: a public wrapper forwards attacker-controlled arguments \
unchecked into the internal function.",
        },
        KnowledgeTopic {
            key: "shared_object",
            title: "Shared object + capability pattern",
            aliases: &["share_object"],
            match_keywords: &["shared object", "share_object", "global state"],
            content: "Shared objects are accessible to everyone by design; mutation safety \
comes from capability parameters and internal assertions, not from restricting access to \
the object itself.\n\
Judgment flow: for each mutating function on the shared object, apply the capability and \
layered-design checks.\n\
Still a real vulnerability when: a mutating path on the shared object has no check on \
any layer.",
        },
        KnowledgeTopic {
            key: "vector_safety",
            title: "Vector bounds checking",
            aliases: &["bounds", "index"],
            match_keywords: &["out of bounds", "index", "vector", "array"],
            content: "`vector::borrow`/`borrow_mut`/`swap` abort on out-of-range indices; \
memory safety is guaranteed, so \"out-of-bounds read/write\" is a false positive.\n\
Judgment flow: confirm the access goes through vector primitives; then consider whether \
a forced abort is itself exploitable (griefing).\n\
Still a real vulnerability when: index arithmetic silently selects the WRONG valid \
element (off-by-one into a different user's entry).",
        },
        KnowledgeTopic {
            key: "borrow_checker",
            title: "Ownership and borrow semantics",
            aliases: &["ownership", "borrow"],
            match_keywords: &["use after free", "double free", "dangling", "borrow"],
            content: "The bytecode verifier enforces unique mutable borrows and consumed-once \
moves; use-after-free/double-spend of a resource value cannot compile.\n\
Judgment flow: findings about memory lifetime are false positives; findings about \
LOGICAL double-counting (e.g. crediting the same deposit twice in storage) are not \
covered and must be examined.\n\
Still a real vulnerability when: the doubling happens in recorded state, not in the \
value's lifetime.",
        },
        KnowledgeTopic {
            key: "sui_object",
            title: "Object ownership model",
            aliases: &["object_model", "owned_object"],
            match_keywords: &["ownership", "owned object", "object model", "position", "forge"],
            content: "Passing `&T`/`&mut T`/`T` of an owned object proves the sender owns it - \
the runtime checks ownership before execution. A function taking `&mut Position` needs no \
extra \"is this the caller's position\" assertion. Struct values can only be constructed \
inside their defining module; attackers cannot forge a `Position` or `Tick`.\n\
Judgment flow: identify whether the object parameter is owned or shared; owned implies \
sender-ownership, shared implies anyone - then re-apply the capability checks for shared \
objects.\n\
Still a real vulnerability when: the object is shared and the function trusts fields an \
attacker can set via another public path.",
        },
        KnowledgeTopic {
            key: "bit_shift",
            title: "Bit shift overflow danger",
            aliases: &["shift", "shl", "shr"],
            match_keywords: &["shift", "<<", ">>", "shl", "shr"],
            content: "Shifts are NOT covered by the VM's arithmetic abort: `x << n` silently \
drops high bits. Fixed-point math libraries using `checked_shlw`-style helpers do their \
own guarding - read them.\n\
Judgment flow: (1) locate the shift; (2) check operand widths and any preceding range \
assertions; (3) follow the helper implementation if the shift is wrapped.\n\
Still a real vulnerability when: a shift on user-influenced values lacks a range check - \
this is one of the few arithmetic bugs Move does not stop; treat seriously.",
        },
    ]
});

/// Look a topic up by key, alias, or fuzzy containment
pub fn lookup_topic(query: &str) -> Option<&'static KnowledgeTopic> {
    let q = query.trim().to_lowercase();
    TOPICS
        .iter()
        .find(|t| t.key == q || t.aliases.iter().any(|a| *a == q))
        .or_else(|| {
            TOPICS
                .iter()
                .find(|t| t.key.contains(q.as_str()) || q.contains(t.key))
        })
        .or_else(|| {
            TOPICS.iter().find(|t| {
                t.match_keywords
                    .iter()
                    .any(|k| q.contains(&k.to_lowercase()))
            })
        })
}

/// All topic keys, for tool error messages
pub fn topic_keys() -> Vec<&'static str> {
    TOPICS.iter().map(|t| t.key).collect()
}

/// Concatenated knowledge relevant to one finding, matched on its title,
/// category and description. Empty when nothing matches.
pub fn relevant_knowledge(finding: &Finding) -> String {
    let haystack = format!(
        "{} {} {}",
        finding.title, finding.category, finding.description
    )
    .to_lowercase();

    let mut sections = Vec::new();
    for topic in TOPICS.iter() {
        if topic
            .match_keywords
            .iter()
            .any(|k| haystack.contains(&k.to_lowercase()))
        {
            sections.push(format!("### {}\n{}", topic.title, topic.content));
        }
    }
    sections.join("\n\n")
}

/// Keywords that describe developer logic errors. Findings containing these
/// must never be pre-flagged as likely false positives, whatever else the
/// description says.
const REAL_VULN_KEYWORDS: &[&str] = &[
    "type check missing",
    "type confusion",
    "missing type check",
    "does not verify the type",
    "type equality",
    "forgot",
    "missing validation",
    "unvalidated generic",
    "wrong comparison",
    "inverted condition",
];

/// Cheap deterministic pre-judgment: does this category/description look
/// like a known language-level false positive? Advisory only - the verdict
/// always belongs to the verifier.
pub fn is_likely_false_positive(category: &str, description: &str) -> Option<String> {
    let haystack = format!("{category} {description}").to_lowercase();

    if REAL_VULN_KEYWORDS.iter().any(|k| haystack.contains(k)) {
        return None;
    }

    let checks: &[(&[&str], &str)] = &[
        (
            &["overflow", "underflow"],
            "arithmetic on +,-,*,/ aborts the transaction at the VM level",
        ),
        (
            &["reentrancy", "reentrant"],
            "Move has no dynamic dispatch; reentrancy cannot occur",
        ),
        (
            &["out of bounds", "index out of"],
            "vector primitives abort on out-of-range access",
        ),
        (
            &["division by zero", "divide by zero"],
            "division by zero aborts the transaction at the VM level",
        ),
    ];

    for (keywords, reason) in checks {
        if keywords.iter().any(|k| haystack.contains(k)) {
            // Shifts escape the VM protection; don't pre-flag them.
            if haystack.contains("shift") || haystack.contains("<<") || haystack.contains(">>") {
                return None;
            }
            return Some((*reason).to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Location, Severity};

    fn finding(title: &str, category: &str, description: &str) -> Finding {
        Finding {
            id: "T-1".into(),
            title: title.into(),
            severity: Severity::High,
            category: category.into(),
            location: Location::default(),
            description: description.into(),
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
    fn lookup_resolves_aliases_and_fuzzy_queries() {
        assert_eq!(lookup_topic("hot_potato").unwrap().key, "hot_potato");
        assert_eq!(lookup_topic("hotpotato").unwrap().key, "hot_potato");
        assert_eq!(lookup_topic("admin_cap").unwrap().key, "capability");
        assert!(lookup_topic("totally-unrelated-xyz").is_none());
    }

    #[test]
    fn relevant_knowledge_matches_flashloan_finding() {
        let f = finding(
            "Flashloan has no enforced repayment",
            "flashloan",
            "The borrow function hands out funds without repayment checks",
        );
        let knowledge = relevant_knowledge(&f);
        assert!(knowledge.contains("Hot-potato"));
    }

    #[test]
    fn overflow_is_pre_flagged_as_likely_fp() {
        assert!(is_likely_false_positive("overflow", "addition may overflow").is_some());
    }

    #[test]
    fn shift_overflow_is_not_pre_flagged() {
        assert!(is_likely_false_positive("overflow", "left shift << may overflow").is_none());
    }

    #[test]
    fn real_vuln_keywords_protect_findings() {
        assert!(is_likely_false_positive(
            "overflow",
            "type confusion: repay does not verify the type matches the borrowed asset"
        )
        .is_none());
    }
}
