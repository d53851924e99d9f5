//! # MoveAudit - LLM-Powered Move Smart Contract Security Audit Engine
//!
//! A multi-agent audit pipeline for Move-family smart contracts on
//! object-capability blockchains. Given a source tree, it produces a
//! ranked set of verified vulnerability findings.
//!
//! ## Pipeline
//!
//! - **Phase 0**: build an immutable project index (modules, functions,
//!   structs, call graph, dependency resolver)
//! - **Phase 1**: structural analysis - hints and function purposes
//! - **Phase 2**: raw vulnerability scan, batched per module
//! - **Phase 3**: grouped verification with soft-filter rules and
//!   knowledge injection to suppress false positives
//! - **Phase 4**: exploit-chain analysis for high-severity confirmed
//!   findings
//! - **Phase 5**: deterministic report assembly
//!
//! ## Architecture
//!
//! - One `ProjectIndex` per audit, read-only after Phase 0
//! - A shared `AgentToolkit` exposing a closed, typed tool surface to
//!   every agent
//! - Role-specialised agents (Analyst, Auditor, Verifier, Manager,
//!   WhiteHat) over one provider-agnostic LLM interface
//! - Bounded concurrency everywhere; cooperative cancellation observed at
//!   every phase boundary and LLM call site

pub mod agents;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod json_repair;
pub mod knowledge;
pub mod llm;
pub mod report;
pub mod rules;
pub mod toolkit;
pub mod types;
pub mod verify;

pub use cache::{cache_key_for_code, AnalysisCache};
pub use config::{AuditConfig, ConcurrencyConfig, LlmSettings, ProviderKind};
pub use engine::SecurityAuditEngine;
pub use error::{AuditError, Result};
pub use indexer::{CodeChunk, ModuleInfo, ProjectIndex};
pub use report::{compute_stats, render_markdown, sort_findings};
pub use rules::apply_exclusion_rules;
pub use toolkit::{AgentToolkit, ContractAnalysis, ToolResult};
pub use types::{
    AuditResult, AuditStats, AuditStatus, CancelToken, ExploitStatus, ExploitVerificationReport,
    Finding, Location, ProgressCallback, Severity, SoftFilterHint, TokenUsage, VerificationStatus,
    VerifiedFinding,
};
pub use verify::RoleSwapVerifier;

/// Re-export of commonly used types
pub mod prelude {
    pub use crate::config::{AuditConfig, LlmSettings, ProviderKind};
    pub use crate::engine::SecurityAuditEngine;
    pub use crate::error::{AuditError, Result};
    pub use crate::indexer::ProjectIndex;
    pub use crate::toolkit::AgentToolkit;
    pub use crate::types::{
        AuditResult, AuditStatus, CancelToken, Finding, Severity, VerificationStatus,
        VerifiedFinding,
    };
}
