//! Project indexer
//!
//! Parses a Move source tree into one queryable, immutable structure:
//! modules, code chunks, call graph and dependency resolver. Built once in
//! Phase 0 and read-only afterwards, so concurrent phases query it without
//! locks.

pub mod callgraph;
pub mod dependency;
pub mod parser;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{AuditError, Result};
use callgraph::{build_callgraph, CallGraph, CallGraphStatus, RiskIndicators};
use dependency::DependencyResolver;
use parser::{FunctionDef, ParsedModule};

/// What kind of code entity a chunk represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Function,
    Struct,
    Module,
}

/// One indexed code unit, the retrieval granule for every agent tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChunk {
    /// `module::name`, unique across the index
    pub id: String,
    pub chunk_type: ChunkType,
    pub module: String,
    pub name: String,
    pub signature: String,
    /// Verbatim source text between the definition's braces
    pub body: String,
    pub visibility: String,
    pub file_path: String,
    pub related_types: Vec<String>,
    pub risk_indicators: RiskIndicators,
    /// Name-based natural-language description for retrieval
    pub description: String,
}

/// Information about one indexed module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub address: String,
    pub structs: Vec<parser::StructDef>,
    pub functions: Vec<FunctionDef>,
    pub constants: Vec<parser::ConstDef>,
    pub imports: Vec<String>,
    pub string_literals: std::collections::BTreeSet<String>,
    pub raw_content: String,
}

impl ModuleInfo {
    pub fn public_functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.functions.iter().filter(|f| f.is_public_or_entry())
    }
}

/// Combined code context for one function
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionContext {
    pub target: Option<CodeChunk>,
    pub callers: Vec<CodeChunk>,
    pub callees: Vec<CodeChunk>,
    /// `(call, implementation)` pairs resolved from the dependency cache
    pub external_deps: Vec<(String, String)>,
    /// `(name, definition)` pairs
    pub related_types: Vec<(String, String)>,
    pub callgraph_status: CallGraphStatus,
    pub warnings: Vec<String>,
}

/// An entry-point function (public or entry visibility)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPointInfo {
    pub id: String,
    pub module: String,
    pub name: String,
    pub signature: String,
    pub visibility: String,
}

/// The immutable project index built in Phase 0
#[derive(Debug, Default)]
pub struct ProjectIndex {
    pub project_path: PathBuf,
    pub modules: BTreeMap<String, ModuleInfo>,
    /// Ordered by module, then source position
    pub chunks: Vec<CodeChunk>,
    pub callgraph: CallGraph,
    pub callgraph_status: CallGraphStatus,
    pub resolver: DependencyResolver,
}

impl ProjectIndex {
    /// Index the project rooted at `project_path`.
    ///
    /// Sources come from `<root>/sources` when present, else the root
    /// itself; paths traversing `build/` or `dependencies/` are skipped.
    /// A single unreadable file is logged and skipped. Failure to build the
    /// call graph degrades the status instead of failing the index.
    pub fn build(project_path: &Path, enable_context_system: bool) -> Result<Self> {
        if !project_path.is_dir() {
            return Err(AuditError::parse(format!(
                "project path is not a directory: {}",
                project_path.display()
            )));
        }
        info!(path = %project_path.display(), "indexing project");

        let resolver = if enable_context_system {
            DependencyResolver::new(project_path)
        } else {
            DependencyResolver::default()
        };

        let sources_dir = {
            let candidate = project_path.join("sources");
            if candidate.is_dir() {
                candidate
            } else {
                project_path.to_path_buf()
            }
        };

        let mut modules = BTreeMap::new();
        for entry in WalkDir::new(&sources_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "move"))
        {
            let rel = entry
                .path()
                .strip_prefix(project_path)
                .unwrap_or(entry.path());
            let rel_str = rel.to_string_lossy();
            if rel_str.contains("build/") || rel_str.contains("dependencies/") {
                continue;
            }

            let content = match std::fs::read_to_string(entry.path()) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            let Some(parsed) = parser::parse_module(&content) else {
                debug!(path = %entry.path().display(), "no module declaration, skipping");
                continue;
            };
            modules.insert(parsed.name.clone(), module_info(parsed, &rel_str));
        }
        info!(modules = modules.len(), "sources parsed");

        let (callgraph, callgraph_status) = if enable_context_system {
            let parsed: BTreeMap<String, ParsedModule> = modules
                .values()
                .map(|m| (m.name.clone(), reparsed(m)))
                .collect();
            build_callgraph(&parsed)
        } else {
            (CallGraph::default(), CallGraphStatus::NotBuilt)
        };

        let mut index = Self {
            project_path: project_path.to_path_buf(),
            modules,
            chunks: Vec::new(),
            callgraph,
            callgraph_status,
            resolver,
        };
        index.generate_chunks();
        info!(
            chunks = index.chunks.len(),
            callgraph = index.callgraph_status.as_str(),
            "index complete"
        );
        Ok(index)
    }

    /// Produce one chunk per function, carrying risk indicators from the
    /// call graph when it was built.
    fn generate_chunks(&mut self) {
        let mut chunks = Vec::new();
        for (module_name, module) in &self.modules {
            for func in &module.functions {
                let id = format!("{module_name}::{}", func.name);
                let risk_indicators = self
                    .callgraph
                    .get(&id)
                    .map(|n| n.risk_indicators.clone())
                    .unwrap_or_default();
                chunks.push(CodeChunk {
                    id: id.clone(),
                    chunk_type: ChunkType::Function,
                    module: module_name.clone(),
                    name: func.name.clone(),
                    signature: func.signature.clone(),
                    body: func.body.clone(),
                    visibility: func.visibility.clone(),
                    file_path: module.path.clone(),
                    related_types: related_types(func, module),
                    risk_indicators,
                    description: describe_function(func, module_name),
                });
            }
        }
        self.chunks = chunks;
    }

    /// Exact chunk lookup by `module::name`
    pub fn chunk_by_id(&self, id: &str) -> Option<&CodeChunk> {
        self.chunks.iter().find(|c| c.id == id)
    }

    /// Find a chunk by module (full or short name) + function name
    pub fn find_chunk(&self, module: &str, function: &str) -> Option<&CodeChunk> {
        self.chunks.iter().find(|c| {
            c.name == function && {
                let short = c.module.rsplit("::").next().unwrap_or(c.module.as_str());
                c.module == module || short == module || c.id.contains(&format!("::{module}::"))
            }
        })
    }

    /// All chunks sharing a function name, for suggestions/auto-correction
    pub fn chunks_named(&self, function: &str) -> Vec<&CodeChunk> {
        self.chunks.iter().filter(|c| c.name == function).collect()
    }

    /// Combined context for one function id (`module::function`)
    pub fn function_context(
        &self,
        func_id: &str,
        depth: usize,
        include_external: bool,
    ) -> FunctionContext {
        let mut ctx = FunctionContext {
            callgraph_status: self.callgraph_status,
            ..Default::default()
        };

        ctx.target = self.chunk_by_id(func_id).cloned();
        let Some(target) = &ctx.target else {
            ctx.warnings.push(format!("target function not found: {func_id}"));
            return ctx;
        };

        if self.callgraph_status.is_ok() {
            if let Some(node) = self.callgraph.get(func_id) {
                let limit = depth.saturating_mul(5).max(5);
                ctx.callers = node
                    .called_by
                    .iter()
                    .take(limit)
                    .filter_map(|id| self.chunk_by_id(id).cloned())
                    .collect();
                ctx.callees = node
                    .calls
                    .iter()
                    .take(limit)
                    .filter_map(|id| self.chunk_by_id(id).cloned())
                    .collect();
            }
        } else {
            ctx.warnings.push(format!(
                "call graph unavailable (status: {}), call relations are limited",
                self.callgraph_status.as_str()
            ));
        }

        if include_external {
            for call in parser::extract_external_calls(&target.body) {
                if let Some(implementation) = self.resolver.find_function(&call, "") {
                    ctx.external_deps.push((call, implementation));
                }
            }
        }

        let type_names = parser::extract_type_names(&target.body);
        for module in self.modules.values() {
            for def in &module.structs {
                if type_names.contains(&def.name) {
                    ctx.related_types.push((def.name.clone(), def.body.clone()));
                }
            }
        }

        ctx
    }

    /// Text summary of the project: directory tree, dependencies, module
    /// overview with struct and public-function signatures. Capped at
    /// roughly `max_tokens` (4 chars per token heuristic).
    pub fn project_overview(&self, max_tokens: usize) -> String {
        let mut parts = Vec::new();

        parts.push("## Project layout\n```".to_string());
        parts.push(self.directory_tree(3));
        parts.push("```\n".to_string());

        if !self.resolver.dependencies.is_empty() {
            parts.push("## Dependencies".to_string());
            for (name, dep) in &self.resolver.dependencies {
                let target = dep
                    .git_url
                    .clone()
                    .or_else(|| dep.local_path.as_ref().map(|p| p.display().to_string()))
                    .unwrap_or_else(|| "unresolved".to_string());
                parts.push(format!("- {name}: {target}"));
            }
            parts.push(String::new());
        }

        parts.push("## Modules".to_string());
        for (name, module) in &self.modules {
            parts.push(format!("### {name}"));
            parts.push(format!("file: {}\n", module.path));
            if !module.structs.is_empty() {
                parts.push("**Types:**".to_string());
                for def in &module.structs {
                    let abilities = if def.abilities.is_empty() {
                        "no abilities - hot potato".to_string()
                    } else {
                        def.abilities.join(", ")
                    };
                    parts.push(format!("- `{}` ({abilities})", def.name));
                }
                parts.push(String::new());
            }
            let public: Vec<_> = module.public_functions().collect();
            if !public.is_empty() {
                parts.push("**Public functions:**".to_string());
                for func in public {
                    parts.push(format!("- `{}`", func.signature));
                }
                parts.push(String::new());
            }
        }

        let mut overview = parts.join("\n");
        let max_chars = max_tokens.saturating_mul(4);
        if overview.len() > max_chars {
            overview.truncate(max_chars);
            overview.push_str("\n... (truncated)");
        }
        overview
    }

    fn directory_tree(&self, max_depth: usize) -> String {
        let mut lines = Vec::new();
        for entry in WalkDir::new(&self.project_path)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let rel = entry
                .path()
                .strip_prefix(&self.project_path)
                .unwrap_or(entry.path());
            if rel.as_os_str().is_empty() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let is_relevant = entry.file_type().is_dir()
                || name.ends_with(".move")
                || name == "Move.toml";
            if !is_relevant || rel.to_string_lossy().contains("build") {
                continue;
            }
            let indent = "  ".repeat(entry.depth().saturating_sub(1));
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            lines.push(format!("{indent}{name}{suffix}"));
        }
        lines.join("\n")
    }

    /// All public/entry functions
    pub fn entry_points(&self) -> Vec<EntryPointInfo> {
        let mut entries = Vec::new();
        for (module_name, module) in &self.modules {
            for func in &module.functions {
                if matches!(func.visibility.as_str(), "public" | "entry" | "public entry") {
                    entries.push(EntryPointInfo {
                        id: format!("{module_name}::{}", func.name),
                        module: module_name.clone(),
                        name: func.name.clone(),
                        signature: func.signature.clone(),
                        visibility: func.visibility.clone(),
                    });
                }
            }
        }
        entries
    }

    /// Search chunk bodies. With `regex=false` this is a plain
    /// case-insensitive substring match.
    pub fn search_code(&self, query: &str, use_regex: bool) -> Result<Vec<&CodeChunk>> {
        if use_regex {
            let re = regex::Regex::new(query)
                .map_err(|e| AuditError::parse(format!("invalid search pattern: {e}")))?;
            Ok(self.chunks.iter().filter(|c| re.is_match(&c.body)).collect())
        } else {
            let needle = query.to_lowercase();
            Ok(self
                .chunks
                .iter()
                .filter(|c| c.body.to_lowercase().contains(&needle))
                .collect())
        }
    }

    /// Total number of indexed functions
    pub fn function_count(&self) -> usize {
        self.chunks.len()
    }
}

fn module_info(parsed: ParsedModule, rel_path: &str) -> ModuleInfo {
    ModuleInfo {
        name: parsed.name,
        path: rel_path.to_string(),
        address: parsed.address,
        structs: parsed.structs,
        functions: parsed.functions,
        constants: parsed.constants,
        imports: parsed.imports,
        string_literals: parsed.string_literals,
        raw_content: parsed.raw_content,
    }
}

// The call graph builder consumes ParsedModule; rebuild the light view from
// the stored ModuleInfo instead of re-reading files.
fn reparsed(module: &ModuleInfo) -> ParsedModule {
    ParsedModule {
        name: module.name.clone(),
        address: module.address.clone(),
        structs: module.structs.clone(),
        functions: module.functions.clone(),
        constants: module.constants.clone(),
        imports: module.imports.clone(),
        string_literals: module.string_literals.clone(),
        raw_content: module.raw_content.clone(),
    }
}

fn related_types(func: &FunctionDef, module: &ModuleInfo) -> Vec<String> {
    let haystack = format!("{} {}", func.params, func.return_type);
    module
        .structs
        .iter()
        .filter(|s| haystack.contains(&s.name))
        .map(|s| s.name.clone())
        .collect()
}

/// Name-based description used for retrieval ranking
fn describe_function(func: &FunctionDef, module_name: &str) -> String {
    let mut notes = Vec::new();
    match func.visibility.as_str() {
        "entry" | "public entry" => notes.push("entry point".to_string()),
        "public" => notes.push("public function".to_string()),
        _ => {}
    }
    let name = func.name.as_str();
    if name.starts_with("create_") || name.starts_with("new_") {
        notes.push("creates a new object".to_string());
    } else if name.starts_with("destroy_") || name.starts_with("delete_") {
        notes.push("destroys an object".to_string());
    } else if name.starts_with("get_") || name.starts_with("is_") || name.starts_with("has_") {
        notes.push("getter/query function".to_string());
    } else if name.starts_with("set_") || name.starts_with("update_") {
        notes.push("setter/update function".to_string());
    } else if ["borrow", "repay", "liquidate", "deposit", "withdraw"].contains(&name) {
        notes.push(format!("DeFi {name} operation"));
    } else if ["swap", "add_liquidity", "remove_liquidity"].contains(&name) {
        notes.push(format!("AMM {name} operation"));
    } else if ["mint", "burn", "transfer"].contains(&name) {
        notes.push(format!("token {name} operation"));
    }
    if notes.is_empty() {
        String::new()
    } else {
        format!("{module_name}::{name} - {}", notes.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_project(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sources")).unwrap();
        std::fs::write(dir.path().join("Move.toml"), "[package]\nname = \"demo\"\n").unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join("sources").join(name), content).unwrap();
        }
        dir
    }

    const POOL: &str = r#"
module demo::pool {
    struct Pool has key { id: UID, reserve: u64 }

    public entry fun withdraw(pool: &mut Pool, amount: u64) {
        pool.reserve = pool.reserve - amount;
    }

    public fun reserve_of(pool: &Pool): u64 { pool.reserve }
}
"#;

    #[test]
    fn builds_index_with_chunks_and_callgraph() {
        let dir = write_project(&[("pool.move", POOL)]);
        let index = ProjectIndex::build(dir.path(), true).unwrap();
        assert_eq!(index.modules.len(), 1);
        assert_eq!(index.function_count(), 2);
        assert!(index.callgraph_status.is_ok());
        assert!(index.chunk_by_id("demo::pool::withdraw").is_some());
    }

    #[test]
    fn empty_project_yields_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = ProjectIndex::build(dir.path(), true).unwrap();
        assert!(index.modules.is_empty());
        assert_eq!(index.function_count(), 0);
        assert_eq!(index.callgraph_status, CallGraphStatus::Empty);
    }

    #[test]
    fn chunk_body_round_trips_verbatim() {
        let dir = write_project(&[("pool.move", POOL)]);
        let index = ProjectIndex::build(dir.path(), true).unwrap();
        let chunk = index.chunk_by_id("demo::pool::reserve_of").unwrap();
        assert!(POOL.contains(&chunk.body));
        assert!(chunk.body.starts_with("public fun reserve_of"));
        assert!(chunk.body.ends_with('}'));
    }

    #[test]
    fn substring_search_matches_bodies_exactly() {
        let dir = write_project(&[("pool.move", POOL)]);
        let index = ProjectIndex::build(dir.path(), true).unwrap();
        let hits = index.search_code("pool.reserve - amount", false).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "demo::pool::withdraw");
        assert!(index.search_code("no_such_text", false).unwrap().is_empty());
    }

    #[test]
    fn entry_points_include_public_and_entry() {
        let dir = write_project(&[("pool.move", POOL)]);
        let index = ProjectIndex::build(dir.path(), true).unwrap();
        let entries = index.entry_points();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.visibility == "public entry"));
    }

    #[test]
    fn context_system_disabled_skips_callgraph() {
        let dir = write_project(&[("pool.move", POOL)]);
        let index = ProjectIndex::build(dir.path(), false).unwrap();
        assert_eq!(index.callgraph_status, CallGraphStatus::NotBuilt);
    }

    #[test]
    fn function_context_reports_missing_target() {
        let dir = write_project(&[("pool.move", POOL)]);
        let index = ProjectIndex::build(dir.path(), true).unwrap();
        let ctx = index.function_context("demo::pool::missing", 2, false);
        assert!(ctx.target.is_none());
        assert!(!ctx.warnings.is_empty());
    }
}
