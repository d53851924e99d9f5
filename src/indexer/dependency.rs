//! Move package dependency resolution
//!
//! Maps `Move.toml` dependencies onto the user-local package cache
//! (conventionally `~/.move`), seeds the framework packages, and extracts
//! external function implementations so agents can see callee bodies that
//! live outside the project.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::indexer::parser;

/// Cache directory patterns for the target chain's framework checkout
const FRAMEWORK_CACHE_PATTERNS: &[&str] = &[
    "https___github_com_MystenLabs_sui_git_mainnet",
    "https___github_com_MystenLabs_sui_git_testnet",
    "https___github_com_MystenLabs_sui_git_devnet",
];

/// (cache directory name, display name, module prefix)
const FRAMEWORK_PACKAGES: &[(&str, &str, &str)] = &[
    ("sui-framework", "Sui", "sui"),
    ("move-stdlib", "MoveStdlib", "std"),
    ("sui-system", "SuiSystem", "sui_system"),
    ("bridge", "Bridge", "bridge"),
];

/// One declared (or seeded) package dependency
#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: String,
    pub git_url: Option<String>,
    pub rev: Option<String>,
    /// Resolved on-disk source tree; absent when the cache misses
    pub local_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct MoveToml {
    #[serde(default)]
    dependencies: BTreeMap<String, toml::Value>,
}

/// Resolves package names to cached source trees and finds external
/// function implementations for agent context.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    pub dependencies: BTreeMap<String, Dependency>,
    cache_root: Option<PathBuf>,
}

impl DependencyResolver {
    /// Build a resolver for the project rooted at `project_root`
    /// (the directory containing `Move.toml`).
    pub fn new(project_root: &Path) -> Self {
        Self::with_cache_root(project_root, dirs::home_dir().map(|h| h.join(".move")))
    }

    /// Same, with an explicit cache directory (used by tests)
    pub fn with_cache_root(project_root: &Path, cache_root: Option<PathBuf>) -> Self {
        let mut resolver = Self {
            dependencies: BTreeMap::new(),
            cache_root,
        };
        resolver.seed_framework_packages();
        resolver.parse_move_toml(project_root);
        resolver.resolve_declared();
        resolver
    }

    /// Seed the framework packages from the cache by glob-matching the
    /// known checkout patterns. Missing cache is not an error; lookups
    /// simply return nothing.
    fn seed_framework_packages(&mut self) {
        let Some(cache) = self.cache_root.clone() else {
            return;
        };
        if !cache.is_dir() {
            debug!(path = %cache.display(), "package cache not found");
            return;
        }

        let mut framework_root = None;
        if let Ok(entries) = std::fs::read_dir(&cache) {
            let mut candidates: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.is_dir()
                        && p.file_name()
                            .and_then(|n| n.to_str())
                            .map(|name| {
                                FRAMEWORK_CACHE_PATTERNS.iter().any(|pat| name.starts_with(pat))
                            })
                            .unwrap_or(false)
                })
                .collect();
            // Prefer mainnet, then the lexically newest rev
            candidates.sort();
            candidates.reverse();
            framework_root = candidates
                .iter()
                .find(|p| p.to_string_lossy().contains("mainnet"))
                .or(candidates.first())
                .cloned();
        }
        let Some(root) = framework_root else {
            debug!("framework cache not found under package cache");
            return;
        };

        for (dir_name, display_name, _prefix) in FRAMEWORK_PACKAGES {
            if let Some(pkg_path) = find_package_dir(&root, dir_name) {
                debug!(package = display_name, path = %pkg_path.display(), "seeded framework package");
                self.dependencies.insert(
                    display_name.to_string(),
                    Dependency {
                        name: display_name.to_string(),
                        git_url: None,
                        rev: None,
                        local_path: Some(pkg_path),
                    },
                );
            }
        }
    }

    /// Parse the project `Move.toml` dependency table
    fn parse_move_toml(&mut self, project_root: &Path) {
        let toml_path = project_root.join("Move.toml");
        let Ok(content) = std::fs::read_to_string(&toml_path) else {
            warn!(path = %toml_path.display(), "Move.toml not found");
            return;
        };
        let parsed: MoveToml = match toml::from_str(&content) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "failed to parse Move.toml");
                return;
            }
        };

        for (name, value) in parsed.dependencies {
            let dep = match value {
                toml::Value::Table(table) => Dependency {
                    name: name.clone(),
                    git_url: table.get("git").and_then(|v| v.as_str()).map(String::from),
                    rev: table.get("rev").and_then(|v| v.as_str()).map(String::from),
                    local_path: table
                        .get("local")
                        .and_then(|v| v.as_str())
                        .map(|p| project_root.join(p)),
                },
                toml::Value::String(path) => Dependency {
                    name: name.clone(),
                    git_url: None,
                    rev: None,
                    local_path: Some(project_root.join(path)),
                },
                _ => continue,
            };
            self.dependencies.insert(name, dep);
        }
    }

    /// Resolve declared git dependencies against the cache, falling back to
    /// fuzzy matching by revision string.
    fn resolve_declared(&mut self) {
        let Some(cache) = self.cache_root.clone() else {
            return;
        };
        for dep in self.dependencies.values_mut() {
            if dep.local_path.is_some() {
                continue;
            }
            let (Some(git_url), Some(rev)) = (&dep.git_url, &dep.rev) else {
                continue;
            };
            let cache_name = git_cache_dir_name(git_url, rev);
            let exact = cache.join(&cache_name);
            if exact.is_dir() {
                debug!(package = %dep.name, path = %exact.display(), "resolved dependency");
                dep.local_path = Some(exact);
                continue;
            }

            // Fuzzy: any cache entry containing the rev and the repo name
            let package_hint = git_url
                .trim_end_matches(".git")
                .rsplit('/')
                .next()
                .unwrap_or("")
                .to_lowercase();
            if let Ok(entries) = std::fs::read_dir(&cache) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    if path.is_dir()
                        && name.contains(rev.as_str())
                        && name.to_lowercase().contains(&package_hint)
                    {
                        debug!(package = %dep.name, path = %path.display(), "fuzzy-resolved dependency");
                        dep.local_path = Some(path);
                        break;
                    }
                }
            }
            if dep.local_path.is_none() {
                warn!(package = %dep.name, cache_name, "dependency cache miss");
            }
        }
    }

    /// Find an external function implementation.
    ///
    /// `module_path` accepts `module::function`, `pkg::module::function`
    /// or a bare module name combined with `function_name`.
    pub fn find_function(&self, module_path: &str, function_name: &str) -> Option<String> {
        let (module_name, function_name) = if module_path.contains("::") {
            let parts: Vec<&str> = module_path.split("::").collect();
            if parts.len() >= 3 {
                (parts[parts.len() - 2], parts[parts.len() - 1])
            } else {
                (parts[0], *parts.last().unwrap_or(&function_name))
            }
        } else {
            (module_path, function_name)
        };
        if function_name.is_empty() {
            return None;
        }

        for dep in self.dependencies.values() {
            let Some(dep_path) = &dep.local_path else {
                continue;
            };
            for entry in WalkDir::new(dep_path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "move"))
            {
                let stem = entry
                    .path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("");
                if stem != module_name && !stem.contains(module_name) {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                if !module_declares(&content, module_name) {
                    continue;
                }
                if let Some(body) = extract_function_body(&content, function_name) {
                    return Some(body);
                }
            }
        }
        None
    }

    /// Find an external struct definition by name
    pub fn find_struct(&self, struct_name: &str) -> Option<(String, String)> {
        for dep in self.dependencies.values() {
            let Some(dep_path) = &dep.local_path else {
                continue;
            };
            for entry in WalkDir::new(dep_path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "move"))
            {
                let Ok(content) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                if !content.contains(struct_name) {
                    continue;
                }
                for def in parser::extract_structs(&content) {
                    if def.name == struct_name {
                        return Some((dep.name.clone(), def.body));
                    }
                }
            }
        }
        None
    }
}

/// Search candidate layouts for a framework package inside a checkout
fn find_package_dir(root: &Path, dir_name: &str) -> Option<PathBuf> {
    let candidates = [
        root.join("crates/sui-framework/packages").join(dir_name),
        root.join("packages").join(dir_name),
        root.join(dir_name),
    ];
    for candidate in candidates {
        if candidate.is_dir()
            && (candidate.join("sources").is_dir() || has_move_files(&candidate))
        {
            return Some(candidate);
        }
    }
    // Last resort: walk for a `<dir_name>/sources` directory
    WalkDir::new(root)
        .max_depth(6)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_type().is_dir()
                && e.file_name() == dir_name
                && e.path().join("sources").is_dir()
        })
        .map(|e| e.into_path())
}

fn has_move_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| {
            entries.any(|e| {
                e.map(|e| e.path().extension().is_some_and(|ext| ext == "move"))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Convert a git URL + revision into the cache directory name:
/// `https://github.com/Org/repo.git` + `rev` becomes
/// `https___github_com_Org_repo_git_rev`.
pub fn git_cache_dir_name(git_url: &str, rev: &str) -> String {
    let url = git_url.trim_end_matches(".git");
    let escaped = url.replace("://", "___").replace(['/', '.'], "_");
    format!("{escaped}_git_{rev}")
}

/// Does `content` declare a module with this short name, under any of the
/// common address forms?
fn module_declares(content: &str, module_name: &str) -> bool {
    let patterns = [
        format!("module sui::{module_name}"),
        format!("module std::{module_name}"),
        format!("module 0x1::{module_name}"),
        format!("module 0x2::{module_name}"),
        format!("::{module_name} {{"),
        format!("module {module_name} {{"),
        format!("module {module_name};"),
    ];
    patterns.iter().any(|p| content.contains(p.as_str()))
}

/// Extract a single brace-matched function body from raw source
fn extract_function_body(content: &str, function_name: &str) -> Option<String> {
    let pattern = format!(
        r"(?:public(?:\([^)]+\))?\s+)?(?:entry\s+)?fun\s+{}\s*[(<]",
        regex::escape(function_name)
    );
    let re = regex::Regex::new(&pattern).ok()?;
    let m = re.find(content)?;
    let end = parser::match_braces(content, m.start())?;
    Some(content[m.start()..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_dir_name_escapes_url() {
        assert_eq!(
            git_cache_dir_name(
                "https://github.com/CetusProtocol/integer-mate.git",
                "mainnet-v1.3.0"
            ),
            "https___github_com_CetusProtocol_integer-mate_git_mainnet-v1.3.0"
        );
    }

    #[test]
    fn resolves_declared_git_dependency_from_cache() {
        let cache = tempfile::tempdir().unwrap();
        let dep_dir = cache
            .path()
            .join("https___github_com_Org_mathlib_git_v1.0.0/sources");
        std::fs::create_dir_all(&dep_dir).unwrap();
        std::fs::write(
            dep_dir.join("math_u256.move"),
            "module mathlib::math_u256 {\n    public fun checked_shlw(x: u256): u256 { x << 64 }\n}\n",
        )
        .unwrap();

        let project = tempfile::tempdir().unwrap();
        std::fs::write(
            project.path().join("Move.toml"),
            "[package]\nname = \"demo\"\n\n[dependencies]\nMathLib = { git = \"https://github.com/Org/mathlib.git\", rev = \"v1.0.0\" }\n",
        )
        .unwrap();

        let resolver = DependencyResolver::with_cache_root(
            project.path(),
            Some(cache.path().to_path_buf()),
        );
        let dep = resolver.dependencies.get("MathLib").unwrap();
        assert!(dep.local_path.is_some());

        let body = resolver
            .find_function("math_u256::checked_shlw", "")
            .expect("function should resolve");
        assert!(body.contains("checked_shlw"));
    }

    #[test]
    fn fuzzy_resolution_matches_by_rev() {
        let cache = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(
            cache
                .path()
                .join("https___github_com_Org_mathlib_extra_git_v2.1.0"),
        )
        .unwrap();

        let project = tempfile::tempdir().unwrap();
        std::fs::write(
            project.path().join("Move.toml"),
            "[package]\nname = \"demo\"\n\n[dependencies]\nMathLib = { git = \"https://gitlab.com/Org/mathlib.git\", rev = \"v2.1.0\" }\n",
        )
        .unwrap();

        let resolver = DependencyResolver::with_cache_root(
            project.path(),
            Some(cache.path().to_path_buf()),
        );
        assert!(resolver.dependencies.get("MathLib").unwrap().local_path.is_some());
    }

    #[test]
    fn missing_cache_yields_no_paths() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(
            project.path().join("Move.toml"),
            "[package]\nname = \"demo\"\n\n[dependencies]\nGone = { git = \"https://github.com/x/gone.git\", rev = \"abc\" }\n",
        )
        .unwrap();
        let resolver = DependencyResolver::with_cache_root(project.path(), None);
        assert!(resolver.dependencies.get("Gone").unwrap().local_path.is_none());
        assert!(resolver.find_function("gone::f", "f").is_none());
    }
}
