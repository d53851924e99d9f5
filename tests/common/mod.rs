//! Shared test support: a routing mock provider and Move project fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use moveaudit::error::Result;
use moveaudit::llm::{ChatMessage, ChatResponse, LlmProvider, Role, ToolSpec, Usage};
use std::path::Path;
use std::sync::Mutex;

type Handler = Box<dyn Fn(&[ChatMessage]) -> Result<ChatResponse> + Send + Sync>;

/// Provider that routes each request through a handler closure and records
/// every prompt it sees.
pub struct MockProvider {
    handler: Handler,
    pub seen_prompts: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(
        handler: impl Fn(&[ChatMessage]) -> Result<ChatResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            seen_prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn response(content: impl Into<String>) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            usage: Usage {
                prompt_tokens: 100,
                completion_tokens: 40,
                total_tokens: 140,
            },
            ..Default::default()
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: Option<&[ToolSpec]>,
    ) -> Result<ChatResponse> {
        let transcript = messages
            .iter()
            .map(|m| format!("[{:?}] {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.seen_prompts.lock().unwrap().push(transcript);
        (self.handler)(messages)
    }

    fn model(&self) -> &str {
        "mock"
    }
}

/// Last user-or-system text of the request, the routing key for handlers
pub fn request_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::System))
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// A flash-loan module with a hot-potato receipt and a type-checking repay
pub const FLASH_SAFE_MODULE: &str = r#"
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

/// Layered design: the low-level acl module is capability-free, its only
/// caller demands an AdminCap
pub const ACL_MODULES: &[(&str, &str)] = &[
    (
        "acl.move",
        r#"
module demo::acl {
    public fun add_role(acl: &mut Acl, member: address, role: u8) {
        vector::push_back(&mut acl.members, member);
        let _ = role;
    }
}
"#,
    ),
    (
        "config.move",
        r#"
module demo::config {
    public fun add_role(_: &AdminCap, acl: &mut Acl, member: address, role: u8) {
        acl::add_role(acl, member, role);
    }
}
"#,
    ),
];

/// Write a Move project fixture and return its tempdir
pub fn write_project(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("sources")).expect("sources dir");
    std::fs::write(dir.path().join("Move.toml"), "[package]\nname = \"demo\"\n").expect("toml");
    for (name, content) in files {
        std::fs::write(dir.path().join("sources").join(name), content).expect("source file");
    }
    dir
}

#[allow(dead_code)]
pub fn project_path(dir: &tempfile::TempDir) -> &Path {
    dir.path()
}
