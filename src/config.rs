//! Audit configuration
//!
//! All pipeline behaviour toggles live here. Defaults mirror the production
//! presets: grouped verification with groups of 5, three concurrent
//! verification groups, 1s cooldown between batches.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AuditError, Result};

/// Which LLM backend a provider config points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Openai,
    Anthropic,
    Deepseek,
    Google,
    Dashscope,
    Ollama,
    OpenaiCompatible,
}

impl ProviderKind {
    /// Parse a provider name; unknown names fall back to OpenAI-compatible
    pub fn parse(s: &str) -> ProviderKind {
        match s.trim().to_lowercase().as_str() {
            "openai" => ProviderKind::Openai,
            "anthropic" | "claude" => ProviderKind::Anthropic,
            "deepseek" => ProviderKind::Deepseek,
            "google" | "gemini" => ProviderKind::Google,
            "dashscope" | "qwen" => ProviderKind::Dashscope,
            "ollama" => ProviderKind::Ollama,
            _ => ProviderKind::OpenaiCompatible,
        }
    }
}

/// Connection settings for one LLM backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Per-call timeout in seconds, enforced at the HTTP client
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_temperature() -> f64 {
    0.1
}
fn default_max_tokens() -> usize {
    4096
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    5
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Openai,
            model: "gpt-4o".to_string(),
            api_key: None,
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmSettings {
    /// Build settings from environment variables
    /// (`MOVEAUDIT_PROVIDER`, `MOVEAUDIT_MODEL`, `MOVEAUDIT_API_KEY`,
    /// `MOVEAUDIT_BASE_URL`).
    pub fn from_env() -> Result<Self> {
        let provider = std::env::var("MOVEAUDIT_PROVIDER")
            .map(|p| ProviderKind::parse(&p))
            .unwrap_or_default();
        let model = std::env::var("MOVEAUDIT_MODEL")
            .map_err(|_| AuditError::config("MOVEAUDIT_MODEL is not set"))?;
        Ok(Self {
            provider,
            model,
            api_key: std::env::var("MOVEAUDIT_API_KEY").ok(),
            base_url: std::env::var("MOVEAUDIT_BASE_URL").ok(),
            ..Default::default()
        })
    }
}

/// Bounded-parallelism limits. Every "do N things in parallel" in the
/// pipeline is bounded by one of these semaphore sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Max concurrent function-analysis batches in Phases 1-2
    pub max_concurrent_analysis: usize,
    /// Max concurrent verification groups in Phase 3
    pub max_concurrent_verify: usize,
    /// Max concurrent exploit analyses in Phase 4
    pub max_concurrent_exploit: usize,
    /// Sleep between batches, seconds
    pub batch_cooldown_secs: f64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_analysis: 3,
            max_concurrent_verify: 3,
            max_concurrent_exploit: 3,
            batch_cooldown_secs: 1.0,
        }
    }
}

/// Full audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Accepted for configuration compatibility. The legacy 5-agent flow
    /// was unified into the verifier pipeline; both values run the same
    /// path.
    pub use_simplified_architecture: bool,
    /// Run Phase 2 broad analysis (all vulnerability categories at once)
    pub enable_broad_analysis: bool,
    /// Run Phase 2 targeted analysis (one vulnerability type per call)
    pub enable_targeted_analysis: bool,
    /// Enable Phase 3 multi-round verification
    pub enable_role_swap: bool,
    /// Enable Phase 4 exploit-chain analysis
    pub enable_exploit_verification: bool,
    /// Build call graph and dependency resolver in Phase 0
    pub enable_context_system: bool,
    /// Grouped (default) vs per-finding verification in Phase 3
    pub use_group_verify: bool,
    /// Findings per verification group
    pub group_size: usize,
    /// Functions per Phase 2 batch analysis call
    pub scan_batch_size: usize,
    /// Vulnerability types iterated in targeted-analysis mode
    pub targeted_vuln_types: Vec<String>,
    /// Where Phase 5 writes the Markdown report (None: skip the file)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Concurrency limits
    pub concurrency: ConcurrencyConfig,
    /// LLM backend shared by all agents
    pub llm: LlmSettings,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            use_simplified_architecture: true,
            enable_broad_analysis: false,
            enable_targeted_analysis: false,
            enable_role_swap: true,
            enable_exploit_verification: true,
            enable_context_system: true,
            use_group_verify: true,
            group_size: 5,
            scan_batch_size: 5,
            targeted_vuln_types: vec![
                "access_control".to_string(),
                "overflow".to_string(),
                "flashloan".to_string(),
                "type_confusion".to_string(),
            ],
            output_dir: None,
            concurrency: ConcurrencyConfig::default(),
            llm: LlmSettings::default(),
        }
    }
}

impl AuditConfig {
    pub fn new(llm: LlmSettings) -> Self {
        Self {
            llm,
            ..Default::default()
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_group_size(mut self, size: usize) -> Self {
        self.group_size = size.max(1);
        self
    }

    /// Validate option combinations before starting an audit
    pub fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            return Err(AuditError::config("group_size must be at least 1"));
        }
        if self.scan_batch_size == 0 {
            return Err(AuditError::config("scan_batch_size must be at least 1"));
        }
        if self.enable_targeted_analysis && self.targeted_vuln_types.is_empty() {
            return Err(AuditError::config(
                "targeted analysis enabled but targeted_vuln_types is empty",
            ));
        }
        if self.llm.model.is_empty() {
            return Err(AuditError::config("llm.model must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(AuditConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_group_size_is_rejected() {
        let mut config = AuditConfig::default();
        config.group_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_kind_parses_aliases() {
        assert_eq!(ProviderKind::parse("claude"), ProviderKind::Anthropic);
        assert_eq!(ProviderKind::parse("qwen"), ProviderKind::Dashscope);
        assert_eq!(
            ProviderKind::parse("my-gateway"),
            ProviderKind::OpenaiCompatible
        );
    }
}
