//! Tool handler implementations
//!
//! Pure in-memory lookups against the project index: fast, synchronous,
//! and safe to call from any number of agent tasks at once.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{AgentToolkit, ToolResult};
use crate::indexer::CodeChunk;
use crate::knowledge;

/// Curated descriptions for common framework functions. Returned by
/// `get_function_code` instead of a failed lookup when the dependency
/// cache has no source for them.
static STDLIB_FUNCTIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("event::emit", "Emits an on-chain event; indexed and externally observable."),
        ("transfer::transfer", "Transfers an object to an address; requires store."),
        ("transfer::public_transfer", "Public object transfer; requires key + store."),
        ("transfer::share_object", "Makes an object shared and accessible to everyone; irreversible."),
        ("transfer::freeze_object", "Freezes an object into immutability."),
        ("object::new", "Creates a fresh UID for object construction."),
        ("object::id", "Returns the object's ID."),
        ("tx_context::sender", "Address of the transaction sender."),
        ("tx_context::epoch", "Current epoch number."),
        ("clock::timestamp_ms", "Current timestamp in milliseconds."),
        ("coin::from_balance", "Wraps a Balance into a Coin object."),
        ("coin::into_balance", "Unwraps a Coin into its Balance."),
        ("coin::value", "Amount held by a Coin."),
        ("coin::split", "Splits off a new Coin of the given amount."),
        ("coin::join", "Merges two Coins."),
        ("balance::value", "Amount held by a Balance."),
        ("balance::split", "Splits off a new Balance of the given amount."),
        ("balance::join", "Merges two Balances."),
        ("balance::zero", "Creates an empty Balance."),
        ("balance::create_for_testing", "TEST ONLY: mints an arbitrary Balance; unavailable in production."),
        ("type_name::get", "Full, module-qualified name of a type; fixed at compile time."),
        ("type_name::into_string", "Converts a TypeName to a string."),
        ("table::new", "Creates a typed key-value Table."),
        ("table::add", "Inserts a key-value pair into a Table."),
        ("table::remove", "Removes and returns a Table value."),
        ("table::contains", "Key-membership check on a Table."),
        ("bag::new", "Creates a heterogeneous Bag."),
        ("bag::add", "Inserts into a Bag."),
        ("bag::remove", "Removes and returns a Bag value."),
        ("dynamic_field::add", "Attaches a dynamic field to an object."),
        ("dynamic_field::remove", "Detaches and returns a dynamic field."),
        ("dynamic_field::exists_", "Dynamic-field existence check."),
        ("dynamic_field::borrow", "Borrows a dynamic field's value."),
        ("dynamic_field::borrow_mut", "Mutably borrows a dynamic field's value."),
        ("vector::empty", "Creates an empty vector."),
        ("vector::push_back", "Appends an element."),
        ("vector::pop_back", "Removes and returns the last element; aborts when empty."),
        ("vector::length", "Vector length."),
        ("vector::borrow", "Borrows an element by index; aborts out of range."),
        ("vector::borrow_mut", "Mutably borrows an element by index; aborts out of range."),
        ("string::utf8", "Builds a UTF-8 string from bytes."),
        ("option::some", "Wraps a value in Option."),
        ("option::none", "The empty Option."),
    ])
});

/// Framework module names whose functions are answered from the curated
/// descriptions when no cached source is available
const STDLIB_MODULES: &[&str] = &[
    "event", "transfer", "object", "tx_context", "clock", "coin", "balance", "type_name",
    "linked_table", "table", "bag", "vec_map", "vec_set", "dynamic_field", "dynamic_object_field",
    "bcs", "hash", "vector", "option", "string", "ascii", "debug", "test_scenario", "test_utils",
];

fn chunk_payload(chunk: &CodeChunk) -> Value {
    json!({
        "id": chunk.id,
        "module": chunk.module,
        "name": chunk.name,
        "signature": chunk.signature,
        "body": chunk.body,
        "visibility": chunk.visibility,
        "file_path": chunk.file_path,
        "risk_indicators": chunk.risk_indicators,
    })
}

impl AgentToolkit {
    // ------------------------------------------------------------------
    // Code retrieval
    // ------------------------------------------------------------------

    pub(super) fn get_function_code(&self, module: &str, function: &str) -> ToolResult {
        // Framework modules: curated description or cached source
        let module_short = module.rsplit("::").next().unwrap_or(module);
        if STDLIB_MODULES.contains(&module_short) && self.index().find_chunk(module, function).is_none()
        {
            if let Some(body) = self
                .index()
                .resolver
                .find_function(&format!("{module_short}::{function}"), function)
            {
                return ToolResult::ok(
                    json!({
                        "id": format!("external::{module_short}::{function}"),
                        "module": module.to_string(),
                        "name": function.to_string(),
                        "body": body,
                        "visibility": "external",
                        "is_stdlib": true,
                    }),
                    "dependency",
                );
            }
            let key = format!("{module_short}::{function}");
            let description = STDLIB_FUNCTIONS
                .get(key.as_str())
                .copied()
                .unwrap_or("Framework standard-library function.");
            return ToolResult::ok(
                json!({
                    "id": format!("stdlib::{module_short}::{function}"),
                    "module": module.to_string(),
                    "name": function.to_string(),
                    "body": format!("// stdlib function {module_short}::{function}\n// {description}"),
                    "visibility": "stdlib",
                    "is_stdlib": true,
                    "description": description,
                }),
                "stdlib",
            );
        }

        // Project code
        if let Some(chunk) = self.index().find_chunk(module, function) {
            return ToolResult::ok(chunk_payload(chunk), "index");
        }

        // Dependency cache, trying the likely path spellings
        for query in [
            format!("{module}::{function}"),
            format!("sui::{module}::{function}"),
            format!("std::{module}::{function}"),
        ] {
            if let Some(body) = self.index().resolver.find_function(&query, function) {
                return ToolResult::ok(
                    json!({
                        "id": format!("external::{query}"),
                        "module": module.to_string(),
                        "name": function.to_string(),
                        "body": body,
                        "visibility": "external",
                    }),
                    "dependency",
                );
            }
        }

        // Wrong module but unique function name: auto-correct and say so
        let suggestions = self.index().chunks_named(function);
        if let Some(best) = suggestions.first() {
            let mut payload = chunk_payload(best);
            payload["_auto_corrected"] = Value::Bool(true);
            payload["_original_query"] = Value::String(format!("{module}::{function}"));
            return ToolResult::ok(payload, "index");
        }

        ToolResult::fail(
            format!("function not found: {module}::{function}"),
            "index",
        )
    }

    pub(super) fn get_callers(&self, module: &str, function: &str, depth: usize) -> ToolResult {
        self.call_relations(module, function, depth, true)
    }

    pub(super) fn get_callees(&self, module: &str, function: &str, depth: usize) -> ToolResult {
        self.call_relations(module, function, depth, false)
    }

    fn call_relations(
        &self,
        module: &str,
        function: &str,
        depth: usize,
        callers: bool,
    ) -> ToolResult {
        if !self.index().callgraph_status.is_ok() {
            return ToolResult::fail("callgraph unavailable", "callgraph");
        }

        let func_id = self
            .index()
            .find_chunk(module, function)
            .map(|c| c.id.clone())
            .unwrap_or_else(|| format!("{module}::{function}"));

        let Some(node) = self.index().callgraph.get(&func_id) else {
            // Suggest the modules actually containing this function name
            let suggestions: Vec<String> = self
                .index()
                .chunks_named(function)
                .iter()
                .take(3)
                .map(|c| c.id.clone())
                .collect();
            if suggestions.is_empty() {
                return ToolResult::fail(
                    format!("function not in call graph: {func_id}"),
                    "callgraph",
                );
            }
            return ToolResult::fail(
                format!("function not in call graph: {func_id}; it exists as: {suggestions:?}"),
                "callgraph",
            );
        };

        let ids = if callers { &node.called_by } else { &node.calls };
        let limit = depth.saturating_mul(5).max(5);
        let enriched: Vec<Value> = ids
            .iter()
            .take(limit)
            .map(|id| match self.index().chunk_by_id(id) {
                Some(chunk) => json!({
                    "id": id,
                    "name": chunk.name,
                    "signature": chunk.signature,
                    "visibility": chunk.visibility,
                    "file_path": chunk.file_path,
                    "source": "callgraph",
                }),
                None => json!({ "id": id, "source": "callgraph" }),
            })
            .collect();

        let key = if callers { "callers" } else { "callees" };
        ToolResult::ok(
            json!({
                "target": func_id,
                key: enriched,
                "depth": depth,
                "callgraph_status": self.index().callgraph_status.as_str(),
            }),
            "callgraph",
        )
    }

    pub(super) fn get_type_definition(&self, type_name: &str) -> ToolResult {
        static GENERIC_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"<[^>]*>").expect("generic strip regex"));
        // `Balance<SUI>` -> `Balance`; `lending::Pool` -> `Pool`
        let clean = GENERIC_RE.replace_all(type_name, "").trim().to_string();
        let search_name = clean.rsplit("::").next().unwrap_or(clean.as_str());

        for module in self.index().modules.values() {
            for def in &module.structs {
                if def.name == search_name {
                    return ToolResult::ok(
                        json!({
                            "name": def.name,
                            "module": module.name,
                            "file_path": module.path,
                            "body": def.body,
                            "abilities": def.abilities,
                            "is_hot_potato": def.is_hot_potato,
                        }),
                        "index",
                    );
                }
            }
        }

        // Error-code constants read like type names; answer them too
        for module in self.index().modules.values() {
            for def in &module.constants {
                if def.name == search_name {
                    return ToolResult::ok(
                        json!({
                            "name": def.name,
                            "module": module.name,
                            "file_path": module.path,
                            "body": def.signature,
                            "type": def.const_type,
                            "value": def.value,
                            "is_constant": true,
                        }),
                        "index",
                    );
                }
            }
        }

        if let Some((package, body)) = self.index().resolver.find_struct(search_name) {
            return ToolResult::ok(
                json!({ "name": search_name, "package": package, "body": body }),
                "dependency",
            );
        }

        // An identifier that only occurs inside string literals is not a type
        for module in self.index().modules.values() {
            if module.string_literals.contains(search_name) {
                return ToolResult::ok(
                    json!({
                        "name": search_name,
                        "is_string_literal": true,
                        "note": format!(
                            "'{search_name}' appears inside a string literal; it is not a type or constant definition"
                        ),
                    }),
                    "index",
                );
            }
        }

        ToolResult::fail(format!("type not found: {type_name}"), "index")
    }

    pub(super) fn search_code_tool(&self, pattern: &str, use_regex: bool) -> ToolResult {
        match self.index().search_code(pattern, use_regex) {
            Ok(matches) => {
                let results: Vec<Value> = matches
                    .iter()
                    .take(20)
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "signature": c.signature,
                            "body": truncate(&c.body, 1500),
                        })
                    })
                    .collect();
                ToolResult::ok(
                    json!({ "count": matches.len(), "matches": results }),
                    "index",
                )
            }
            Err(e) => ToolResult::fail(e.to_string(), "index"),
        }
    }

    pub(super) fn get_project_overview(&self, max_tokens: usize) -> ToolResult {
        ToolResult::ok(
            Value::String(self.index().project_overview(max_tokens)),
            "index",
        )
    }

    pub(super) fn get_function_context_tool(
        &self,
        module: &str,
        function: &str,
        depth: usize,
    ) -> ToolResult {
        let func_id = self
            .index()
            .find_chunk(module, function)
            .map(|c| c.id.clone())
            .unwrap_or_else(|| format!("{module}::{function}"));
        let ctx = self.index().function_context(&func_id, depth, true);
        if ctx.target.is_none() {
            return ToolResult::fail(
                format!("function not found: {func_id}"),
                "index",
            );
        }
        ToolResult::ok(
            json!({
                "target": ctx.target.as_ref().map(chunk_payload),
                "callers": ctx.callers.iter().map(|c| json!({
                    "id": c.id, "signature": c.signature, "visibility": c.visibility,
                })).collect::<Vec<_>>(),
                "callees": ctx.callees.iter().map(|c| json!({
                    "id": c.id, "signature": c.signature, "body": truncate(&c.body, 800),
                })).collect::<Vec<_>>(),
                "external_deps": ctx.external_deps.iter().map(|(call, implementation)| json!({
                    "call": call, "implementation": truncate(implementation, 800),
                })).collect::<Vec<_>>(),
                "related_types": ctx.related_types.iter().map(|(name, body)| json!({
                    "name": name, "definition": body,
                })).collect::<Vec<_>>(),
                "metadata": {
                    "callgraph_status": ctx.callgraph_status.as_str(),
                    "warnings": ctx.warnings,
                },
            }),
            "index",
        )
    }

    pub(super) fn get_entry_points_tool(&self) -> ToolResult {
        let entries = self.index().entry_points();
        ToolResult::ok(
            json!({
                "count": entries.len(),
                "entry_points": entries,
            }),
            "index",
        )
    }

    // ------------------------------------------------------------------
    // Phase 0/1 analysis
    // ------------------------------------------------------------------

    pub(super) fn get_function_purpose(&self, function_id: &str) -> ToolResult {
        let analysis = self.contract_analysis();
        if analysis.function_purposes.is_empty() {
            return ToolResult::fail(
                "function purposes are not available yet (structural analysis has not run)",
                "contract_analysis",
            );
        }

        if let Some(purpose) = analysis.function_purposes.get(function_id) {
            return ToolResult::ok(
                json!({ "function_id": function_id, "purpose": purpose }),
                "contract_analysis",
            );
        }
        // Partial match on the bare function name
        for (fid, purpose) in &analysis.function_purposes {
            if fid.ends_with(&format!("::{function_id}"))
                || fid.rsplit("::").next() == Some(function_id)
            {
                return ToolResult::ok(
                    json!({ "function_id": fid, "purpose": purpose }),
                    "contract_analysis",
                );
            }
        }
        ToolResult::fail(
            format!("no purpose recorded for {function_id}"),
            "contract_analysis",
        )
    }

    pub(super) fn get_analysis_hints(&self, hint_type: &str) -> ToolResult {
        let analysis = self.contract_analysis();
        let hints = &analysis.analysis_hints;
        if hints.is_null() || hints.as_object().map(|o| o.is_empty()).unwrap_or(false) {
            return ToolResult::fail(
                "analysis hints are not available yet (structural analysis has not run)",
                "contract_analysis",
            );
        }
        if hint_type == "all" {
            return ToolResult::ok(hints.clone(), "contract_analysis");
        }
        const VALID: &[&str] = &[
            "key_state_variables",
            "condition_thresholds",
            "cross_function_dataflow",
            "state_change_points",
            "potential_vuln_chains",
            "analysis_summary",
        ];
        if !VALID.contains(&hint_type) {
            return ToolResult::fail(
                format!("invalid hint_type: {hint_type}; valid: {VALID:?}"),
                "contract_analysis",
            );
        }
        ToolResult::ok(
            json!({
                "hint_type": hint_type,
                "data": hints.get(hint_type).cloned().unwrap_or(Value::Array(vec![])),
            }),
            "contract_analysis",
        )
    }

    // ------------------------------------------------------------------
    // Call-graph & structure overviews
    // ------------------------------------------------------------------

    pub(super) fn get_callgraph_summary(&self, include_edges: bool) -> ToolResult {
        if !self.index().callgraph_status.is_ok() {
            return ToolResult::fail("callgraph unavailable", "callgraph");
        }
        let graph = &self.index().callgraph;

        let entry_points: Vec<Value> = graph
            .nodes
            .values()
            .filter(|n| n.visibility.contains("public") || n.visibility.contains("entry"))
            .take(20)
            .map(|n| json!({ "id": n.id, "visibility": n.visibility }))
            .collect();
        let leaf_nodes: Vec<&String> = graph
            .nodes
            .values()
            .filter(|n| n.calls.is_empty())
            .take(20)
            .map(|n| &n.id)
            .collect();
        let cross_module: Vec<Value> = graph
            .edges
            .iter()
            .filter(|e| module_of(&e.from) != module_of(&e.to))
            .take(20)
            .map(|e| json!({ "from": e.from, "to": e.to }))
            .collect();
        let risky: Vec<Value> = graph
            .nodes
            .values()
            .filter(|n| !n.risk_indicators.is_empty())
            .take(10)
            .map(|n| json!({ "id": n.id, "risk": n.risk_indicators }))
            .collect();

        let mut data = json!({
            "mode": graph.mode,
            "node_count": graph.node_count(),
            "edge_count": graph.edge_count(),
            "entry_points": entry_points,
            "leaf_nodes": leaf_nodes,
            "cross_module_calls": cross_module,
            "risky_functions": risky,
        });
        if include_edges {
            data["edges"] = serde_json::to_value(
                graph.edges.iter().take(100).collect::<Vec<_>>(),
            )
            .unwrap_or(Value::Array(vec![]));
        }
        ToolResult::ok(data, "callgraph")
    }

    pub(super) fn get_module_structure(&self, module_name: &str) -> ToolResult {
        if !module_name.is_empty() {
            for (name, module) in &self.index().modules {
                if name.contains(module_name) {
                    let functions: Vec<Value> = self
                        .index()
                        .chunks
                        .iter()
                        .filter(|c| &c.module == name)
                        .map(|c| {
                            json!({
                                "name": c.name,
                                "visibility": c.visibility,
                                "signature": c.signature,
                            })
                        })
                        .collect();
                    return ToolResult::ok(
                        json!({
                            "module": name,
                            "path": module.path,
                            "functions": functions,
                            "structs": module.structs.iter().map(|s| json!({
                                "name": s.name,
                                "abilities": s.abilities,
                                "is_hot_potato": s.is_hot_potato,
                            })).collect::<Vec<_>>(),
                            "constants": module.constants.iter().map(|c| &c.signature).collect::<Vec<_>>(),
                        }),
                        "index",
                    );
                }
            }
            return ToolResult::fail(format!("module not found: {module_name}"), "index");
        }

        let overview: Vec<Value> = self
            .index()
            .modules
            .iter()
            .map(|(name, module)| {
                json!({
                    "module": name,
                    "function_count": module.functions.len(),
                    "struct_count": module.structs.len(),
                })
            })
            .collect();
        ToolResult::ok(
            json!({ "module_count": overview.len(), "modules": overview }),
            "index",
        )
    }

    pub(super) fn get_risky_functions(&self, risk_type: &str) -> ToolResult {
        let filtered: Vec<Value> = self
            .index()
            .chunks
            .iter()
            .filter(|chunk| {
                let ind = &chunk.risk_indicators;
                match risk_type {
                    "funds" => ind.handles_funds > 0,
                    "state" => ind.modifies_state > 0,
                    "access" => ind.access_control > 0,
                    _ => !ind.is_empty(),
                }
            })
            .take(50)
            .map(|chunk| {
                json!({
                    "id": chunk.id,
                    "name": chunk.name,
                    "visibility": chunk.visibility,
                    "indicators": chunk.risk_indicators,
                })
            })
            .collect();
        ToolResult::ok(
            json!({ "risk_type": risk_type, "count": filtered.len(), "functions": filtered }),
            "index",
        )
    }

    // ------------------------------------------------------------------
    // Security knowledge
    // ------------------------------------------------------------------

    pub(super) fn query_security_knowledge(&self, topic: &str, _include_examples: bool) -> ToolResult {
        match knowledge::lookup_topic(topic) {
            Some(entry) => ToolResult::ok(
                json!({
                    "topic": entry.key,
                    "title": entry.title,
                    "content": entry.content,
                }),
                "knowledge",
            ),
            None => ToolResult::fail(
                format!(
                    "unknown topic: {topic}; available: {:?}",
                    knowledge::topic_keys()
                ),
                "knowledge",
            ),
        }
    }

    pub(super) fn search_vulnerability_patterns(&self, _query: &str) -> ToolResult {
        // The vector corpus is an optional external collaborator; without it
        // the tool reports unavailability and agents proceed on the static
        // knowledge base.
        ToolResult::fail("vulnerability pattern corpus is not configured", "rag")
    }

    pub(super) fn get_exploit_examples(&self, _vuln_type: &str) -> ToolResult {
        ToolResult::fail("exploit example corpus is not configured", "rag")
    }

    // ------------------------------------------------------------------
    // Deterministic pattern detectors
    // ------------------------------------------------------------------

    /// Flash-loan safety check: locates the receipt struct, inspects its
    /// abilities (no drop = hot potato = enforced repayment), and inspects
    /// the repay function for type-equality, amount and pool-id assertions.
    /// Emits explicit false-positive and real-vulnerability indicators.
    pub(super) fn check_flashloan_security(
        &self,
        receipt_type: &str,
        repay_function: &str,
    ) -> ToolResult {
        const RECEIPT_PATTERNS: &[&str] = &["receipt", "flashreceipt", "flashloanreceipt", "loan"];
        const REPAY_PATTERNS: &[&str] = &["repay", "repay_flashloan", "repay_flash", "return_loan"];

        let mut fp_indicators: Vec<String> = Vec::new();
        let mut vuln_indicators: Vec<String> = Vec::new();
        let mut hot_potato_safe = false;
        let mut type_check_safe = false;
        let mut type_confusion_vulnerable = false;
        let mut amount_check_safe = false;
        let mut pool_id_check_safe = false;
        let mut receipt_struct = Value::Null;
        let mut repay_code = Value::Null;

        // Locate the receipt struct
        'outer: for module in self.index().modules.values() {
            for def in &module.structs {
                let matched = if receipt_type.is_empty() {
                    RECEIPT_PATTERNS
                        .iter()
                        .any(|p| def.name.to_lowercase().contains(p))
                } else {
                    def.name.eq_ignore_ascii_case(receipt_type)
                };
                if matched {
                    let has_drop = def.abilities.iter().any(|a| a.eq_ignore_ascii_case("drop"));
                    if !has_drop {
                        hot_potato_safe = true;
                        fp_indicators.push(format!(
                            "{} has no drop ability (hot potato): repayment is enforced by the language",
                            def.name
                        ));
                    } else {
                        vuln_indicators.push(format!(
                            "{} has the drop ability: repayment can be skipped",
                            def.name
                        ));
                    }
                    receipt_struct = json!({
                        "name": def.name,
                        "module": module.name,
                        "abilities": def.abilities,
                        "body": def.body,
                    });
                    break 'outer;
                }
            }
        }

        // Locate the repay function
        let repay_chunk = self.index().chunks.iter().find(|chunk| {
            let name = chunk.name.to_lowercase();
            if repay_function.is_empty() {
                REPAY_PATTERNS.iter().any(|p| name.contains(p))
            } else {
                name == repay_function.to_lowercase()
            }
        });

        if let Some(chunk) = repay_chunk {
            repay_code = json!({
                "name": chunk.name,
                "module": chunk.module,
                "body": truncate(&chunk.body, 2000),
            });
            let code = &chunk.body;

            static TYPE_CHECK_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
                [
                    r"type_name::get<[^>]*>\s*\(\s*\)\s*==",
                    r"==\s*\w*\.?type_name",
                    r"assert!\s*\([^;]*type_name[^;]*==",
                    r"ETypeMismatch",
                ]
                .iter()
                .map(|p| Regex::new(&format!("(?i){p}")).expect("type check regex"))
                .collect()
            });
            for re in TYPE_CHECK_RES.iter() {
                if re.is_match(code) {
                    type_check_safe = true;
                    fp_indicators
                        .push("repay asserts type equality against the receipt".to_string());
                    break;
                }
            }
            if !type_check_safe && code.contains("contains_type") && !code.contains("type_name::get")
            {
                type_confusion_vulnerable = true;
                vuln_indicators.push(
                    "repay only checks type membership (contains_type) and never compares the \
repaid type with the borrowed one: type-confusion risk"
                        .to_string(),
                );
            }

            static AMOUNT_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
                [
                    r"assert!\s*\([^;]*(coin|balance)::value[^;]*>=",
                    r"assert!\s*\([^;]*amount\s*==",
                    r"ERepayAmountMismatch",
                    r"repay_amount",
                ]
                .iter()
                .map(|p| Regex::new(&format!("(?i){p}")).expect("amount regex"))
                .collect()
            });
            amount_check_safe = AMOUNT_RES.iter().any(|re| re.is_match(code));

            static POOL_ID_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
                [r"object::id\s*\(\s*pool\s*\)\s*==", r"pool_id\s*==", r"EPoolIdMismatch"]
                    .iter()
                    .map(|p| Regex::new(&format!("(?i){p}")).expect("pool id regex"))
                    .collect()
            });
            pool_id_check_safe = POOL_ID_RES.iter().any(|re| re.is_match(code));
        }

        let security_summary = if hot_potato_safe && type_check_safe && amount_check_safe && pool_id_check_safe {
            "flash loan looks safe: hot potato plus type/amount/pool-id assertions"
        } else if hot_potato_safe && type_check_safe {
            "core protections present: hot potato enforces repayment, repay validates the type"
        } else if hot_potato_safe && type_confusion_vulnerable {
            "hot potato present but the repay type check is membership-only: possible type confusion"
        } else if hot_potato_safe {
            "hot potato enforces repayment but the repay-side type check was not found"
        } else {
            "no hot-potato receipt found: flash-loan safety needs manual review"
        };

        ToolResult::ok(
            json!({
                "hot_potato_safe": hot_potato_safe,
                "type_check_safe": type_check_safe,
                "type_confusion_vulnerable": type_confusion_vulnerable,
                "amount_check_safe": amount_check_safe,
                "pool_id_check_safe": pool_id_check_safe,
                "receipt_struct": receipt_struct,
                "repay_function_code": repay_code,
                "security_summary": security_summary,
                "false_positive_indicators": fp_indicators,
                "real_vulnerability_indicators": vuln_indicators,
                "is_no_enforcement_false_positive": hot_potato_safe,
            }),
            "pattern",
        )
    }
}

fn module_of(func_id: &str) -> &str {
    func_id.rsplit_once("::").map(|(m, _)| m).unwrap_or(func_id)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::ProjectIndex;
    use std::sync::Arc;

    const FLASH_SAFE: &str = r#"
module demo::flash {
    struct FlashReceipt {
        amount: u64,
        type_name: TypeName,
    }

    public fun borrow<A>(pool: &mut Pool, amount: u64): (Balance<A>, FlashReceipt) {
        let taken = balance::split(&mut pool.reserve, amount);
        (taken, FlashReceipt { amount, type_name: type_name::get<A>() })
    }

    public fun repay<A>(pool: &mut Pool, payment: Balance<A>, receipt: FlashReceipt) {
        let FlashReceipt { amount, type_name } = receipt;
        assert!(type_name::get<A>() == type_name, 1);
        assert!(balance::value(&payment) >= amount, 2);
        balance::join(&mut pool.reserve, payment);
    }
}
"#;

    const FLASH_CONFUSED: &str = r#"
module demo::flash {
    struct FlashReceipt {
        amount: u64,
    }

    public fun repay<A>(pool: &mut Pool, payment: Balance<A>, receipt: FlashReceipt) {
        let FlashReceipt { amount } = receipt;
        assert!(contains_type<A>(pool), 1);
        assert!(balance::value(&payment) >= amount, 2);
        balance::join(&mut pool.reserve, payment);
    }
}
"#;

    fn toolkit_for(source: &str) -> AgentToolkit {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sources")).unwrap();
        std::fs::write(dir.path().join("sources/flash.move"), source).unwrap();
        let index = ProjectIndex::build(dir.path(), true).unwrap();
        let toolkit = AgentToolkit::new(Arc::new(index));
        std::mem::forget(dir); // keep fixture alive for the toolkit's lifetime
        toolkit
    }

    #[test]
    fn flashloan_check_recognises_hot_potato_with_type_check() {
        let tk = toolkit_for(FLASH_SAFE);
        let result = tk.call_tool("check_flashloan_security", &serde_json::json!({}), "test");
        assert!(result.success);
        assert_eq!(result.data["hot_potato_safe"], true);
        assert_eq!(result.data["type_check_safe"], true);
        assert_eq!(result.data["type_confusion_vulnerable"], false);
        assert_eq!(result.data["is_no_enforcement_false_positive"], true);
    }

    #[test]
    fn flashloan_check_flags_membership_only_type_check() {
        let tk = toolkit_for(FLASH_CONFUSED);
        let result = tk.call_tool("check_flashloan_security", &serde_json::json!({}), "test");
        assert!(result.success);
        assert_eq!(result.data["hot_potato_safe"], true);
        assert_eq!(result.data["type_check_safe"], false);
        assert_eq!(result.data["type_confusion_vulnerable"], true);
    }

    #[test]
    fn get_function_code_auto_corrects_module() {
        let tk = toolkit_for(FLASH_SAFE);
        let result = tk.call_tool(
            "get_function_code",
            &serde_json::json!({"module": "wrong_module", "function": "repay"}),
            "test",
        );
        assert!(result.success);
        assert_eq!(result.data["_auto_corrected"], true);
        assert_eq!(result.data["module"], "demo::flash");
    }

    #[test]
    fn stdlib_function_gets_description() {
        let tk = toolkit_for(FLASH_SAFE);
        let result = tk.call_tool(
            "get_function_code",
            &serde_json::json!({"module": "balance", "function": "join"}),
            "test",
        );
        assert!(result.success);
        assert_eq!(result.data["is_stdlib"], true);
    }

    #[test]
    fn type_definition_reports_hot_potato() {
        let tk = toolkit_for(FLASH_SAFE);
        let result = tk.call_tool(
            "get_type_definition",
            &serde_json::json!({"type_name": "FlashReceipt"}),
            "test",
        );
        assert!(result.success);
        assert_eq!(result.data["is_hot_potato"], true);
    }

    #[test]
    fn generic_type_names_are_stripped() {
        let tk = toolkit_for(FLASH_SAFE);
        let result = tk.call_tool(
            "get_type_definition",
            &serde_json::json!({"type_name": "FlashReceipt<SUI>"}),
            "test",
        );
        assert!(result.success);
        assert_eq!(result.data["name"], "FlashReceipt");
    }

    #[test]
    fn callers_on_degraded_graph_reports_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let index = ProjectIndex::build(dir.path(), true).unwrap(); // empty -> degraded
        let tk = AgentToolkit::new(Arc::new(index));
        let result = tk.call_tool(
            "get_callers",
            &serde_json::json!({"module": "m", "function": "f"}),
            "test",
        );
        assert!(!result.success);
        assert!(result.error.unwrap().contains("callgraph unavailable"));
    }

    #[test]
    fn knowledge_query_resolves_topic() {
        let tk = toolkit_for(FLASH_SAFE);
        let result = tk.call_tool(
            "query_security_knowledge",
            &serde_json::json!({"topic": "hot_potato"}),
            "test",
        );
        assert!(result.success);
        assert!(result.data["content"].as_str().unwrap().contains("abilities"));
    }

    #[test]
    fn pattern_corpus_tools_report_unavailable() {
        let tk = toolkit_for(FLASH_SAFE);
        let result = tk.call_tool(
            "search_vulnerability_patterns",
            &serde_json::json!({"query": "flashloan"}),
            "test",
        );
        assert!(!result.success);
    }
}
