//! Agent toolkit
//!
//! A closed, typed tool surface backed by the project index. Agents reach
//! code context exclusively through `call_tool`; every call is validated,
//! panic-isolated and logged with the calling role.
//!
//! Thread safety: the index is read-only after Phase 0, the tool registry
//! is read-only after construction, and the single writable field
//! (`contract_analysis`, produced by Phase 1) sits behind an `RwLock` that
//! is written exactly once.

mod handlers;

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::indexer::ProjectIndex;
use crate::llm::ToolSpec;

/// Result of one tool call. Handlers never panic through the dispatcher;
/// failures are carried in `error`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Data provenance: index, callgraph, dependency, stdlib, knowledge, ...
    pub source: String,
}

impl ToolResult {
    pub fn ok(data: Value, source: &str) -> Self {
        Self {
            success: true,
            data,
            error: None,
            source: source.to_string(),
        }
    }

    pub fn fail(error: impl Into<String>, source: &str) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            source: source.to_string(),
        }
    }

    /// Serialised form fed back to the model as a tool message
    pub fn to_tool_message(&self) -> String {
        if self.success {
            serde_json::to_string(&json!({ "source": self.source, "data": self.data }))
                .unwrap_or_else(|_| "{}".to_string())
        } else {
            format!(
                "error: {}",
                self.error.as_deref().unwrap_or("unknown tool failure")
            )
        }
    }
}

/// Phase 0/1 analysis attached to the toolkit after the Analyst runs.
/// This is the single source of truth for background context; it is not a
/// global.
#[derive(Debug, Clone, Default)]
pub struct ContractAnalysis {
    /// Structured hints: key state variables, condition thresholds,
    /// cross-function dataflow, state change points, vulnerability chains
    pub analysis_hints: Value,
    /// `function_id -> natural-language purpose`
    pub function_purposes: HashMap<String, String>,
}

/// The toolkit shared by every agent in one audit
pub struct AgentToolkit {
    index: Arc<ProjectIndex>,
    contract_analysis: RwLock<ContractAnalysis>,
    specs: Vec<ToolSpec>,
}

impl AgentToolkit {
    pub fn new(index: Arc<ProjectIndex>) -> Self {
        Self {
            index,
            contract_analysis: RwLock::new(ContractAnalysis::default()),
            specs: build_tool_specs(),
        }
    }

    pub fn index(&self) -> &ProjectIndex {
        &self.index
    }

    /// Store the Phase 1 analysis. Called once, after the Analyst finishes;
    /// the lock makes the single write safe against concurrent readers.
    pub fn set_contract_analysis(&self, analysis: ContractAnalysis) {
        match self.contract_analysis.write() {
            Ok(mut slot) => *slot = analysis,
            Err(poisoned) => *poisoned.into_inner() = analysis,
        }
    }

    pub(crate) fn contract_analysis(&self) -> ContractAnalysis {
        self.contract_analysis
            .read()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// All tool specs
    pub fn tool_specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    /// The security-audit subset handed to Phase 2/3/4 agents
    pub fn security_tools(&self) -> Vec<ToolSpec> {
        const SECURITY_TOOLS: &[&str] = &[
            "get_function_code",
            "get_callers",
            "get_callees",
            "get_type_definition",
            "search_code",
            "get_function_context",
            "get_function_purpose",
            "get_analysis_hints",
            "query_security_knowledge",
            "search_vulnerability_patterns",
            "check_flashloan_security",
            "get_exploit_examples",
            "get_risky_functions",
            "get_callgraph_summary",
            "get_module_structure",
        ];
        self.specs
            .iter()
            .filter(|s| SECURITY_TOOLS.contains(&s.name.as_str()))
            .cloned()
            .collect()
    }

    /// Dispatch one tool call. Unknown tools, missing required arguments
    /// and handler panics all come back as `{success: false, error}` so the
    /// model can retry or adapt.
    pub fn call_tool(&self, name: &str, arguments: &Value, caller: &str) -> ToolResult {
        let Some(spec) = self.specs.iter().find(|s| s.name == name) else {
            return ToolResult::fail(format!("unknown tool: {name}"), "toolkit");
        };

        if let Some(required) = spec.parameters.get("required").and_then(|r| r.as_array()) {
            let missing: Vec<&str> = required
                .iter()
                .filter_map(|r| r.as_str())
                .filter(|key| arguments.get(key).is_none())
                .collect();
            if !missing.is_empty() {
                return ToolResult::fail(
                    format!("missing required parameters: {missing:?}"),
                    "toolkit",
                );
            }
        }

        debug!(caller, tool = name, args = %compact_args(arguments), "tool call");

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.dispatch(name, arguments)
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(_) => ToolResult::fail(format!("tool handler panicked: {name}"), "toolkit"),
        };

        if result.success {
            debug!(caller, tool = name, source = %result.source, "tool ok");
        } else {
            warn!(caller, tool = name, error = ?result.error, "tool failed");
        }
        result
    }

    fn dispatch(&self, name: &str, args: &Value) -> ToolResult {
        let s = |key: &str| {
            args.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };
        let n = |key: &str, default: u64| args.get(key).and_then(|v| v.as_u64()).unwrap_or(default);
        let b = |key: &str, default: bool| {
            args.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
        };

        match name {
            "get_function_code" => self.get_function_code(&s("module"), &s("function")),
            "get_callers" => self.get_callers(&s("module"), &s("function"), n("depth", 2) as usize),
            "get_callees" => self.get_callees(&s("module"), &s("function"), n("depth", 2) as usize),
            "get_type_definition" => self.get_type_definition(&s("type_name")),
            "search_code" => self.search_code_tool(&s("pattern"), b("regex", true)),
            "get_project_overview" => self.get_project_overview(n("max_tokens", 5000) as usize),
            "get_function_context" => {
                self.get_function_context_tool(&s("module"), &s("function"), n("depth", 2) as usize)
            }
            "get_entry_points" => self.get_entry_points_tool(),
            "get_function_purpose" => self.get_function_purpose(&s("function_id")),
            "get_analysis_hints" => {
                let hint_type = args
                    .get("hint_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("all");
                self.get_analysis_hints(hint_type)
            }
            "get_callgraph_summary" => self.get_callgraph_summary(b("include_edges", false)),
            "get_module_structure" => self.get_module_structure(&s("module_name")),
            "get_risky_functions" => {
                let risk_type = args
                    .get("risk_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("all");
                self.get_risky_functions(risk_type)
            }
            "query_security_knowledge" => {
                self.query_security_knowledge(&s("topic"), b("include_examples", true))
            }
            "search_vulnerability_patterns" => self.search_vulnerability_patterns(&s("query")),
            "get_exploit_examples" => self.get_exploit_examples(&s("vuln_type")),
            "check_flashloan_security" => {
                self.check_flashloan_security(&s("receipt_type"), &s("repay_function"))
            }
            _ => ToolResult::fail(format!("unknown tool: {name}"), "toolkit"),
        }
    }

    // ------------------------------------------------------------------
    // Prompt builders
    // ------------------------------------------------------------------

    /// Index of queryable functions, grouped by module, injected into
    /// verification prompts so the model knows what it can ask for.
    pub fn function_index(&self, max_functions: usize) -> String {
        let mut lines = vec![
            "## Queryable functions".to_string(),
            "Use `get_function_code(module, function)` with the module names below.".to_string(),
        ];

        let mut grouped: std::collections::BTreeMap<&str, Vec<&crate::indexer::CodeChunk>> =
            std::collections::BTreeMap::new();
        for chunk in self.index.chunks.iter().take(max_functions) {
            grouped.entry(chunk.module.as_str()).or_default().push(chunk);
        }

        for (module, chunks) in grouped {
            lines.push(format!("\n### {module}"));
            for chunk in chunks {
                let risk = chunk.risk_indicators.risk_score;
                let risk_tag = if risk > 50 {
                    format!(" (risk:{risk})")
                } else {
                    String::new()
                };
                lines.push(format!("- `{}` [{}]{risk_tag}", chunk.name, chunk.visibility));
            }
        }
        lines.push(format!("\n{} functions total", self.index.function_count()));
        lines.join("\n")
    }

    /// Phase 0/1 background context for verification prompts
    pub fn analysis_context(&self) -> String {
        let analysis = self.contract_analysis();
        let mut lines = vec!["## Contract analysis context".to_string()];

        if !analysis.function_purposes.is_empty() {
            lines.push("### Function purposes".to_string());
            for (func_id, purpose) in analysis.function_purposes.iter().take(20) {
                let name = func_id.rsplit("::").next().unwrap_or(func_id.as_str());
                let short: String = purpose.chars().take(100).collect();
                lines.push(format!("- `{name}`: {short}"));
            }
        }

        if let Some(hints) = analysis.analysis_hints.as_object() {
            if let Some(vars) = hints.get("key_state_variables").and_then(|v| v.as_array()) {
                if !vars.is_empty() {
                    lines.push("### Key state variables".to_string());
                    for var in vars.iter().take(5) {
                        lines.push(format!("- {}", summarise_hint(var)));
                    }
                }
            }
            if let Some(chains) = hints.get("potential_vuln_chains").and_then(|v| v.as_array()) {
                if !chains.is_empty() {
                    lines.push("### Potential vulnerability chains".to_string());
                    for chain in chains.iter().take(3) {
                        lines.push(format!("- {}", summarise_hint(chain)));
                    }
                }
            }
        }

        if self.index.callgraph_status.is_ok() {
            lines.push(format!(
                "### Call graph: {} nodes, {} edges",
                self.index.callgraph.node_count(),
                self.index.callgraph.edge_count()
            ));
        }
        lines.join("\n")
    }
}

fn summarise_hint(value: &Value) -> String {
    match value {
        Value::String(s) => s.chars().take(80).collect(),
        Value::Object(map) => {
            let name = map
                .get("name")
                .or_else(|| map.get("chain"))
                .or_else(|| map.get("description"))
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            let description = map
                .get("description")
                .or_else(|| map.get("security_relevance"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let short: String = description.chars().take(60).collect();
            format!("{name}: {short}")
        }
        other => other.to_string().chars().take(80).collect(),
    }
}

fn compact_args(args: &Value) -> String {
    let text = args.to_string();
    if text.len() > 160 {
        let mut cut = 160;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    } else {
        text
    }
}

/// The fixed tool set with JSON-schema parameter definitions
fn build_tool_specs() -> Vec<ToolSpec> {
    fn spec(name: &str, description: &str, parameters: Value) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }

    vec![
        spec(
            "get_function_code",
            "Get the full implementation of a function (project code, falling back to the dependency cache for stdlib)",
            json!({
                "type": "object",
                "properties": {
                    "module": {"type": "string", "description": "Module name, e.g. 'pool' or 'cetus::pool'"},
                    "function": {"type": "string", "description": "Function name"}
                },
                "required": ["module", "function"]
            }),
        ),
        spec(
            "get_callers",
            "List the functions that call the given function (who can reach it)",
            json!({
                "type": "object",
                "properties": {
                    "module": {"type": "string"},
                    "function": {"type": "string"},
                    "depth": {"type": "integer", "default": 2}
                },
                "required": ["module", "function"]
            }),
        ),
        spec(
            "get_callees",
            "List the functions the given function calls",
            json!({
                "type": "object",
                "properties": {
                    "module": {"type": "string"},
                    "function": {"type": "string"},
                    "depth": {"type": "integer", "default": 2}
                },
                "required": ["module", "function"]
            }),
        ),
        spec(
            "get_type_definition",
            "Get a struct or constant definition by name (generics are stripped automatically)",
            json!({
                "type": "object",
                "properties": {
                    "type_name": {"type": "string", "description": "e.g. 'Pool', 'Balance<SUI>' or 'lending::Pool'"}
                },
                "required": ["type_name"]
            }),
        ),
        spec(
            "search_code",
            "Search function bodies by regex or substring",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "regex": {"type": "boolean", "default": true}
                },
                "required": ["pattern"]
            }),
        ),
        spec(
            "get_project_overview",
            "Project summary: layout, dependencies, module/struct/function signatures",
            json!({
                "type": "object",
                "properties": {
                    "max_tokens": {"type": "integer", "default": 5000}
                }
            }),
        ),
        spec(
            "get_function_context",
            "Combined view: function body plus callers, callees, external deps and related types",
            json!({
                "type": "object",
                "properties": {
                    "module": {"type": "string"},
                    "function": {"type": "string"},
                    "depth": {"type": "integer", "default": 2}
                },
                "required": ["module", "function"]
            }),
        ),
        spec(
            "get_entry_points",
            "List all public/entry functions (the external attack surface)",
            json!({"type": "object", "properties": {}}),
        ),
        spec(
            "get_function_purpose",
            "Natural-language purpose of a function, produced during structural analysis",
            json!({
                "type": "object",
                "properties": {
                    "function_id": {"type": "string", "description": "module::function or bare function name"}
                },
                "required": ["function_id"]
            }),
        ),
        spec(
            "get_analysis_hints",
            "Structural-analysis hints: key state variables, thresholds, dataflow, vulnerability chains",
            json!({
                "type": "object",
                "properties": {
                    "hint_type": {
                        "type": "string",
                        "enum": ["all", "key_state_variables", "condition_thresholds",
                                 "cross_function_dataflow", "state_change_points",
                                 "potential_vuln_chains", "analysis_summary"],
                        "default": "all"
                    }
                }
            }),
        ),
        spec(
            "get_callgraph_summary",
            "Call-graph overview: entry points, leaves, cross-module calls, risky functions",
            json!({
                "type": "object",
                "properties": {
                    "include_edges": {"type": "boolean", "default": false}
                }
            }),
        ),
        spec(
            "get_module_structure",
            "Full listing of one module (functions, structs, constants) or an overview of all modules",
            json!({
                "type": "object",
                "properties": {
                    "module_name": {"type": "string"}
                }
            }),
        ),
        spec(
            "get_risky_functions",
            "Functions with static risk indicators, filtered by risk type",
            json!({
                "type": "object",
                "properties": {
                    "risk_type": {"type": "string", "enum": ["funds", "state", "access", "all"], "default": "all"}
                }
            }),
        ),
        spec(
            "query_security_knowledge",
            "Curated Move security knowledge by topic (overflow, capability, hot_potato, ...)",
            json!({
                "type": "object",
                "properties": {
                    "topic": {"type": "string"},
                    "include_examples": {"type": "boolean", "default": true}
                },
                "required": ["topic"]
            }),
        ),
        spec(
            "search_vulnerability_patterns",
            "Vector search over the historical vulnerability corpus (when configured)",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "top_k": {"type": "integer", "default": 5},
                    "severity_filter": {"type": "string", "default": "all"}
                },
                "required": ["query"]
            }),
        ),
        spec(
            "get_exploit_examples",
            "Historical exploit examples for a vulnerability type (when configured)",
            json!({
                "type": "object",
                "properties": {
                    "vuln_type": {"type": "string"},
                    "top_k": {"type": "integer", "default": 3}
                },
                "required": ["vuln_type"]
            }),
        ),
        spec(
            "check_flashloan_security",
            "Deterministic flash-loan safety check: receipt abilities (hot potato), type/amount/pool-id assertions in repay",
            json!({
                "type": "object",
                "properties": {
                    "receipt_type": {"type": "string"},
                    "repay_function": {"type": "string"}
                }
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolkit() -> AgentToolkit {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sources")).unwrap();
        std::fs::write(
            dir.path().join("sources/pool.move"),
            r#"
module demo::pool {
    struct Pool has key { id: UID, reserve: u64 }
    public fun withdraw(pool: &mut Pool, amount: u64) { pool.reserve = pool.reserve - amount; }
}
"#,
        )
        .unwrap();
        let index = ProjectIndex::build(dir.path(), true).unwrap();
        AgentToolkit::new(Arc::new(index))
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let tk = toolkit();
        let result = tk.call_tool("no_such_tool", &json!({}), "test");
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown tool"));
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let tk = toolkit();
        let result = tk.call_tool("get_function_code", &json!({"module": "pool"}), "test");
        assert!(!result.success);
        assert!(result.error.unwrap().contains("missing required"));
    }

    #[test]
    fn security_tools_exclude_overview() {
        let tk = toolkit();
        let names: Vec<String> = tk.security_tools().iter().map(|s| s.name.clone()).collect();
        assert!(names.contains(&"get_function_code".to_string()));
        assert!(names.contains(&"check_flashloan_security".to_string()));
        assert!(!names.contains(&"get_project_overview".to_string()));
    }

    #[test]
    fn function_index_lists_modules() {
        let tk = toolkit();
        let index = tk.function_index(100);
        assert!(index.contains("demo::pool"));
        assert!(index.contains("withdraw"));
    }

    #[test]
    fn contract_analysis_single_write() {
        let tk = toolkit();
        let mut purposes = HashMap::new();
        purposes.insert("demo::pool::withdraw".to_string(), "removes funds".to_string());
        tk.set_contract_analysis(ContractAnalysis {
            analysis_hints: json!({"analysis_summary": "short"}),
            function_purposes: purposes,
        });
        let ctx = tk.analysis_context();
        assert!(ctx.contains("withdraw"));
        assert!(ctx.contains("removes funds"));
    }
}
