//! Function-level call graph
//!
//! Built from the parsed modules by name matching on call sites (regex
//! mode). An absent or degraded graph must not block later phases: the
//! status is recorded and consumers fall back to chunk-index suggestions.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use super::parser::ParsedModule;

/// How the graph was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallGraphMode {
    Lsp,
    #[default]
    Regex,
    None,
}

/// Build outcome, recorded on the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallGraphStatus {
    Ok,
    Empty,
    Failed,
    #[default]
    NotBuilt,
}

impl CallGraphStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, CallGraphStatus::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallGraphStatus::Ok => "ok",
            CallGraphStatus::Empty => "empty",
            CallGraphStatus::Failed => "failed",
            CallGraphStatus::NotBuilt => "not_built",
        }
    }
}

/// Static risk indicators scanned from a function body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskIndicators {
    /// Coin/Balance transfers and splits
    pub handles_funds: u32,
    /// Writes through &mut receivers and field assignments
    pub modifies_state: u32,
    /// Capability parameters and assert-based permission checks
    pub access_control: u32,
    /// Shift operators, unprotected by the VM's abort-on-overflow
    pub bit_shifts: u32,
    /// Arithmetic sites (+, -, *, /)
    pub arithmetic_ops: u32,
    /// 0-100 aggregate
    pub risk_score: u32,
}

impl RiskIndicators {
    pub fn is_empty(&self) -> bool {
        self.risk_score == 0
    }
}

/// One node per function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionNode {
    /// `module::function`
    pub id: String,
    pub visibility: String,
    pub risk_indicators: RiskIndicators,
    /// Ids of functions that call this one
    pub called_by: BTreeSet<String>,
    /// Ids of functions this one calls
    pub calls: BTreeSet<String>,
}

/// A directed call edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEdge {
    pub from: String,
    pub to: String,
}

/// The whole graph plus build metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallGraph {
    pub nodes: BTreeMap<String, FunctionNode>,
    pub edges: Vec<CallEdge>,
    pub mode: CallGraphMode,
}

impl CallGraph {
    pub fn get(&self, func_id: &str) -> Option<&FunctionNode> {
        self.nodes.get(func_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

static CALL_SITE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:(\w+)::)?(\w+)\s*\(").expect("call site regex"));

const MOVE_KEYWORDS: &[&str] = &[
    "if", "else", "while", "loop", "return", "abort", "assert", "let", "fun", "move", "copy",
    "spec", "match",
];

/// Build a call graph from parsed modules using name matching.
///
/// Call resolution order per call site `qualifier::name(` or `name(`:
/// 1. qualified: a module whose short name equals the qualifier
/// 2. unqualified: the same module, then a unique match anywhere
pub fn build_callgraph(modules: &BTreeMap<String, ParsedModule>) -> (CallGraph, CallGraphStatus) {
    let mut graph = CallGraph {
        mode: CallGraphMode::Regex,
        ..Default::default()
    };

    // Function name lookup tables
    let mut by_short_module: HashMap<(String, String), String> = HashMap::new();
    let mut by_name: HashMap<String, Vec<String>> = HashMap::new();

    for (module_name, module) in modules {
        let short = module_name
            .rsplit("::")
            .next()
            .unwrap_or(module_name.as_str())
            .to_string();
        for func in &module.functions {
            let id = format!("{module_name}::{}", func.name);
            by_short_module.insert((short.clone(), func.name.clone()), id.clone());
            by_name.entry(func.name.clone()).or_default().push(id.clone());
            graph.nodes.insert(
                id.clone(),
                FunctionNode {
                    id,
                    visibility: func.visibility.clone(),
                    risk_indicators: scan_risk_indicators(&func.body, &func.params),
                    called_by: BTreeSet::new(),
                    calls: BTreeSet::new(),
                },
            );
        }
    }

    if graph.nodes.is_empty() {
        warn!("call graph is empty; later phases degrade to no-callgraph mode");
        return (graph, CallGraphStatus::Empty);
    }

    // Resolve call sites
    let mut edges = BTreeSet::new();
    for (module_name, module) in modules {
        let short = module_name.rsplit("::").next().unwrap_or(module_name.as_str());
        for func in &module.functions {
            let caller_id = format!("{module_name}::{}", func.name);
            for caps in CALL_SITE_RE.captures_iter(&func.body) {
                let qualifier = caps.get(1).map(|m| m.as_str());
                let callee_name = &caps[2];
                if MOVE_KEYWORDS.contains(&callee_name) {
                    continue;
                }

                let target = match qualifier {
                    Some(q) => by_short_module
                        .get(&(q.to_string(), callee_name.to_string()))
                        .cloned(),
                    None => by_short_module
                        .get(&(short.to_string(), callee_name.to_string()))
                        .cloned()
                        .or_else(|| {
                            by_name.get(callee_name).and_then(|ids| {
                                if ids.len() == 1 {
                                    Some(ids[0].clone())
                                } else {
                                    None
                                }
                            })
                        }),
                };

                if let Some(callee_id) = target {
                    if callee_id != caller_id {
                        edges.insert((caller_id.clone(), callee_id));
                    }
                }
            }
        }
    }

    for (from, to) in edges {
        if let Some(node) = graph.nodes.get_mut(&from) {
            node.calls.insert(to.clone());
        }
        if let Some(node) = graph.nodes.get_mut(&to) {
            node.called_by.insert(from.clone());
        }
        graph.edges.push(CallEdge { from, to });
    }

    debug!(
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "call graph built"
    );
    (graph, CallGraphStatus::Ok)
}

/// Scan a function body for static risk indicators
pub fn scan_risk_indicators(body: &str, params: &str) -> RiskIndicators {
    static FUNDS_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(balance::(split|join|withdraw)|coin::(split|join|from_balance|into_balance|take)|transfer::(public_)?transfer)")
            .expect("funds regex")
    });
    static STATE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(&mut\s+\w|\.\w+\s*=\s*[^=])").expect("state regex"));
    static ACCESS_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(assert!\s*\(|&\w*Cap\b|AdminCap|OwnerCap|sender\s*\(\s*\w*\s*\)\s*==)")
            .expect("access regex")
    });
    static SHIFT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(<<|>>)").expect("shift regex"));
    static ARITH_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"[\w)]\s*[-+*/]\s*[\w(]").expect("arith regex"));

    let haystack = format!("{params}\n{body}");
    let mut indicators = RiskIndicators {
        handles_funds: FUNDS_RE.find_iter(&haystack).count() as u32,
        modifies_state: STATE_RE.find_iter(body).count() as u32,
        access_control: ACCESS_RE.find_iter(&haystack).count() as u32,
        bit_shifts: SHIFT_RE.find_iter(body).count() as u32,
        arithmetic_ops: ARITH_RE.find_iter(body).count() as u32,
        risk_score: 0,
    };

    let mut score = 0u32;
    score += indicators.handles_funds.min(4) * 15;
    score += indicators.modifies_state.min(4) * 5;
    score += indicators.bit_shifts.min(2) * 10;
    if indicators.handles_funds > 0 && indicators.access_control == 0 {
        score += 20;
    }
    indicators.risk_score = score.min(100);
    indicators
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::parser::parse_module;

    fn modules_from(sources: &[&str]) -> BTreeMap<String, ParsedModule> {
        let mut map = BTreeMap::new();
        for src in sources {
            let module = parse_module(src).expect("parse");
            map.insert(module.name.clone(), module);
        }
        map
    }

    #[test]
    fn builds_intra_module_edges() {
        let modules = modules_from(&[r#"
module demo::acl {
    public fun add_role(member: address) { record(member); }
    fun record(member: address) { let _ = member; }
}
"#]);
        let (graph, status) = build_callgraph(&modules);
        assert!(status.is_ok());
        let node = graph.get("demo::acl::add_role").unwrap();
        assert!(node.calls.contains("demo::acl::record"));
        let callee = graph.get("demo::acl::record").unwrap();
        assert!(callee.called_by.contains("demo::acl::add_role"));
    }

    #[test]
    fn builds_cross_module_edges_via_qualifier() {
        let modules = modules_from(&[
            r#"
module demo::acl {
    public fun add_role(member: address) { let _ = member; }
}
"#,
            r#"
module demo::config {
    public fun add_role(cap: &AdminCap, member: address) { acl::add_role(member); }
}
"#,
        ]);
        let (graph, _) = build_callgraph(&modules);
        let caller = graph.get("demo::config::add_role").unwrap();
        assert!(caller.calls.contains("demo::acl::add_role"));
    }

    #[test]
    fn empty_project_reports_empty_status() {
        let (graph, status) = build_callgraph(&BTreeMap::new());
        assert_eq!(status, CallGraphStatus::Empty);
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn risk_indicators_flag_unchecked_fund_handling() {
        let indicators = scan_risk_indicators(
            "fun take(pool: &mut Pool, amount: u64) { let c = balance::split(&mut pool.reserve, amount); }",
            "pool: &mut Pool, amount: u64",
        );
        assert!(indicators.handles_funds > 0);
        assert_eq!(indicators.access_control, 0);
        assert!(indicators.risk_score >= 35);
    }

    #[test]
    fn capability_param_counts_as_access_control() {
        let indicators = scan_risk_indicators(
            "fun set(cap: &AdminCap) { }",
            "cap: &AdminCap",
        );
        assert!(indicators.access_control > 0);
    }
}
