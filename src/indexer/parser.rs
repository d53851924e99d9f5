//! Move source parsing
//!
//! Regex-driven extraction of modules, structs, functions, constants and
//! string literals from Move source text. Supports both the 1.0 block
//! syntax (`module addr::name { ... }`) and the 2.0 label syntax
//! (`module addr::name;`). Bodies are captured by brace matching so a
//! chunk's text is byte-identical to the source between its braces.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

// Pre-compiled patterns; shared by every parse call.
static MODULE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"module\s+(?:(\w+)::)?(\w+)\s*[{;]").expect("module regex"));
static STRUCT_ABILITIES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:public\s+)?struct\s+(\w+)(?:<[^>]+>)?\s+has\s+([\w,\s]+?)\s*\{")
        .expect("struct-with-abilities regex")
});
static STRUCT_PLAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:public\s+)?struct\s+(\w+)(?:<[^>]+>)?\s*\{").expect("plain struct regex")
});
static FUNCTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)(public\s*\(\s*(?:friend|package)\s*\)\s+|public\s+entry\s+|public\s+|entry\s+)?fun\s+(\w+)(<[^>]+>)?\s*\(([^)]*)\)(?:\s*:\s*([^{]+))?\s*\{",
    )
    .expect("function regex")
});
static CONST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"const\s+(\w+)\s*:\s*(\w+)\s*=\s*([^;]+);").expect("const regex"));
static USE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"use\s+([\w:]+)(?:::\{([^}]+)\})?;").expect("use regex"));
static STRING_LIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"b?"([^"]*)""#).expect("string literal regex"));
static STRING_IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z][A-Za-z0-9]*)\b").expect("string ident regex"));

/// A parsed struct definition
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StructDef {
    pub name: String,
    pub abilities: Vec<String>,
    pub signature: String,
    pub body: String,
    /// No abilities at all: the language forces linear consumption.
    /// This is a safety pattern, not a defect.
    pub is_hot_potato: bool,
}

/// A parsed function definition
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FunctionDef {
    pub name: String,
    /// public, public(package), public(friend), entry, public entry, private
    pub visibility: String,
    pub signature: String,
    pub params: String,
    pub return_type: String,
    /// Brace-matched body including the signature line
    pub body: String,
    /// Byte offset of the definition in the file
    pub offset: usize,
}

impl FunctionDef {
    pub fn is_public_or_entry(&self) -> bool {
        matches!(
            self.visibility.as_str(),
            "public" | "entry" | "public entry" | "public(friend)" | "public(package)"
        )
    }
}

/// A parsed constant definition
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConstDef {
    pub name: String,
    pub const_type: String,
    pub value: String,
    pub signature: String,
}

/// A parsed Move module
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ParsedModule {
    /// Fully-qualified name, `address::name` when an address is present
    pub name: String,
    pub address: String,
    pub structs: Vec<StructDef>,
    pub functions: Vec<FunctionDef>,
    pub constants: Vec<ConstDef>,
    pub imports: Vec<String>,
    /// Capitalised identifiers that only occur inside string literals;
    /// these must not be mistaken for type names.
    pub string_literals: BTreeSet<String>,
    pub raw_content: String,
}

/// Find the end (exclusive byte index) of a brace-delimited block starting
/// at `start`. Returns `None` when braces never balance (truncated source).
pub fn match_braces(content: &str, start: usize) -> Option<usize> {
    let bytes = content.as_bytes();
    let mut depth = 0i32;
    let mut entered = false;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => {
                depth += 1;
                entered = true;
            }
            b'}' => {
                depth -= 1;
                if entered && depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Parse one Move source file. Returns `None` when no module header is
/// present (e.g. a script file).
pub fn parse_module(content: &str) -> Option<ParsedModule> {
    let caps = MODULE_RE.captures(content)?;
    let address = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
    let module_name = caps.get(2)?.as_str().to_string();
    let full_name = if address.is_empty() {
        module_name
    } else {
        format!("{address}::{module_name}")
    };

    Some(ParsedModule {
        name: full_name,
        address,
        structs: extract_structs(content),
        functions: extract_functions(content),
        constants: extract_constants(content),
        imports: extract_imports(content),
        string_literals: extract_string_literal_idents(content),
        raw_content: content.to_string(),
    })
}

/// Extract struct definitions, both `struct Foo has key, store { .. }` and
/// the ability-less hot-potato form `struct Receipt { .. }`.
pub fn extract_structs(content: &str) -> Vec<StructDef> {
    let mut structs = Vec::new();
    let mut seen = BTreeSet::new();

    for caps in STRUCT_ABILITIES_RE.captures_iter(content) {
        let name = caps[1].to_string();
        let abilities: Vec<String> = caps[2]
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        let Some(end) = match_braces(content, start) else {
            continue;
        };
        seen.insert(name.clone());
        structs.push(StructDef {
            signature: format!("struct {} has {}", name, abilities.join(", ")),
            name,
            abilities,
            body: content[start..end].to_string(),
            is_hot_potato: false,
        });
    }

    for caps in STRUCT_PLAIN_RE.captures_iter(content) {
        let name = caps[1].to_string();
        if seen.contains(&name) {
            continue;
        }
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        let Some(end) = match_braces(content, start) else {
            continue;
        };
        structs.push(StructDef {
            signature: format!("struct {name}"),
            name,
            abilities: Vec::new(),
            body: content[start..end].to_string(),
            is_hot_potato: true,
        });
    }

    structs
}

/// Extract function definitions with brace-matched bodies
pub fn extract_functions(content: &str) -> Vec<FunctionDef> {
    let mut functions = Vec::new();

    for caps in FUNCTION_RE.captures_iter(content) {
        let visibility_raw = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let name = caps[2].to_string();
        let type_params = caps.get(3).map(|m| m.as_str()).unwrap_or("");
        let params = caps.get(4).map(|m| m.as_str()).unwrap_or("").to_string();
        let return_type = caps
            .get(5)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        // Compound forms first: "public entry" and the package/friend forms
        let is_public = visibility_raw.contains("public");
        let is_entry = visibility_raw.contains("entry");
        let visibility = if visibility_raw.contains("package") {
            "public(package)".to_string()
        } else if visibility_raw.contains("friend") {
            "public(friend)".to_string()
        } else if is_public && is_entry {
            "public entry".to_string()
        } else if is_public {
            "public".to_string()
        } else if is_entry {
            "entry".to_string()
        } else {
            "private".to_string()
        };

        let mut sig_parts = Vec::new();
        if visibility != "private" {
            sig_parts.push(visibility.clone());
        }
        sig_parts.push(format!("fun {name}{type_params}({params})"));
        let mut signature = sig_parts.join(" ");
        if !return_type.is_empty() {
            signature.push_str(&format!(": {return_type}"));
        }

        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        let Some(end) = match_braces(content, start) else {
            continue;
        };

        functions.push(FunctionDef {
            name,
            visibility,
            signature,
            params,
            return_type,
            body: content[start..end].to_string(),
            offset: start,
        });
    }

    functions
}

/// Extract `const NAME: TYPE = VALUE;` definitions. Error-code constants
/// matter for understanding abort reasons.
pub fn extract_constants(content: &str) -> Vec<ConstDef> {
    CONST_RE
        .captures_iter(content)
        .map(|caps| {
            let name = caps[1].to_string();
            let const_type = caps[2].to_string();
            let value = caps[3].trim().to_string();
            ConstDef {
                signature: format!("const {name}: {const_type} = {value}"),
                name,
                const_type,
                value,
            }
        })
        .collect()
}

/// Extract `use` statements, expanding grouped imports
pub fn extract_imports(content: &str) -> Vec<String> {
    let mut imports = Vec::new();
    for caps in USE_RE.captures_iter(content) {
        let module = caps[1].to_string();
        if let Some(items) = caps.get(2) {
            for item in items.as_str().split(',') {
                let item = item.trim();
                if !item.is_empty() {
                    imports.push(format!("{module}::{item}"));
                }
            }
        } else {
            imports.push(module);
        }
    }
    imports
}

/// Collect capitalised identifiers occurring inside string and byte-string
/// literals, e.g. `CTF` and `Task2` in `"CTF{MoveCTF-Task2}"` or `WLP` in
/// `b"WLP"`. Used to keep the type-definition tool from treating literal
/// content as a type name.
pub fn extract_string_literal_idents(content: &str) -> BTreeSet<String> {
    let mut idents = BTreeSet::new();
    for caps in STRING_LIT_RE.captures_iter(content) {
        for ident in STRING_IDENT_RE.captures_iter(&caps[1]) {
            idents.insert(ident[1].to_string());
        }
    }
    idents
}

/// Extract `pkg::module::function` calls from a function body
pub fn extract_external_calls(code: &str) -> Vec<String> {
    static EXTERNAL_CALL_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(\w+)::(\w+)::(\w+)\s*[(<]").expect("external call regex"));
    let mut calls = Vec::new();
    for caps in EXTERNAL_CALL_RE.captures_iter(code) {
        let call = format!("{}::{}::{}", &caps[1], &caps[2], &caps[3]);
        if !calls.contains(&call) {
            calls.push(call);
        }
    }
    calls
}

/// Capitalised identifiers in a piece of code; a cheap type-name heuristic
pub fn extract_type_names(code: &str) -> BTreeSet<String> {
    static TYPE_NAME_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\b([A-Z][a-zA-Z0-9_]*)\b").expect("type name regex"));
    TYPE_NAME_RE
        .captures_iter(code)
        .map(|caps| caps[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
module lending::pool {
    use sui::balance::{Self, Balance};
    use sui::coin;

    const E_INSUFFICIENT: u64 = 1;
    const FEE_PRECISION: u64 = 10000;

    struct Pool has key, store {
        id: UID,
        reserve: Balance<SUI>,
    }

    struct FlashReceipt {
        amount: u64,
        type_name: TypeName,
    }

    public fun deposit(pool: &mut Pool, amount: Balance<SUI>) {
        balance::join(&mut pool.reserve, amount);
    }

    public entry fun borrow(pool: &mut Pool, amount: u64, ctx: &mut TxContext) {
        let taken = balance::split(&mut pool.reserve, amount);
        transfer::public_transfer(coin::from_balance(taken, ctx), tx_context::sender(ctx));
    }

    fun internal_rate(pool: &Pool): u64 {
        balance::value(&pool.reserve) / FEE_PRECISION
    }

    public(package) fun settle(pool: &mut Pool) {
        let _ = internal_rate(pool);
    }
}
"#;

    #[test]
    fn parses_module_header() {
        let module = parse_module(SAMPLE).unwrap();
        assert_eq!(module.name, "lending::pool");
        assert_eq!(module.address, "lending");
    }

    #[test]
    fn parses_module_label_syntax() {
        let module = parse_module("module demo::thing;\npublic fun f() { }").unwrap();
        assert_eq!(module.name, "demo::thing");
    }

    #[test]
    fn struct_abilities_and_hot_potato() {
        let module = parse_module(SAMPLE).unwrap();
        let pool = module.structs.iter().find(|s| s.name == "Pool").unwrap();
        assert_eq!(pool.abilities, vec!["key", "store"]);
        assert!(!pool.is_hot_potato);

        let receipt = module
            .structs
            .iter()
            .find(|s| s.name == "FlashReceipt")
            .unwrap();
        assert!(receipt.abilities.is_empty());
        assert!(receipt.is_hot_potato);
    }

    #[test]
    fn function_visibility_forms() {
        let module = parse_module(SAMPLE).unwrap();
        let get = |name: &str| {
            module
                .functions
                .iter()
                .find(|f| f.name == name)
                .unwrap_or_else(|| panic!("missing function {name}"))
        };
        assert_eq!(get("deposit").visibility, "public");
        assert_eq!(get("borrow").visibility, "public entry");
        assert_eq!(get("internal_rate").visibility, "private");
        assert_eq!(get("settle").visibility, "public(package)");
    }

    #[test]
    fn function_body_is_brace_matched_verbatim() {
        let module = parse_module(SAMPLE).unwrap();
        let body = &module
            .functions
            .iter()
            .find(|f| f.name == "internal_rate")
            .unwrap()
            .body;
        assert!(body.starts_with("fun internal_rate"));
        assert!(body.ends_with('}'));
        // Verbatim slice of the original source
        assert!(SAMPLE.contains(body.as_str()));
    }

    #[test]
    fn constants_extracted() {
        let module = parse_module(SAMPLE).unwrap();
        let e = module
            .constants
            .iter()
            .find(|c| c.name == "E_INSUFFICIENT")
            .unwrap();
        assert_eq!(e.const_type, "u64");
        assert_eq!(e.value, "1");
    }

    #[test]
    fn imports_expand_grouped_items() {
        let module = parse_module(SAMPLE).unwrap();
        assert!(module.imports.contains(&"sui::balance::Self".to_string()));
        assert!(module.imports.contains(&"sui::balance::Balance".to_string()));
        assert!(module.imports.contains(&"sui::coin".to_string()));
    }

    #[test]
    fn string_literal_idents_detected() {
        let idents = extract_string_literal_idents(r#"let flag = b"WLP"; let s = "CTF{MoveCTF-Task2}";"#);
        assert!(idents.contains("WLP"));
        assert!(idents.contains("CTF"));
        assert!(idents.contains("MoveCTF"));
        assert!(idents.contains("Task2"));
    }

    #[test]
    fn external_calls_found() {
        let calls = extract_external_calls("let x = sui::balance::join(a, b); math::u64::min(1, 2);");
        assert!(calls.contains(&"sui::balance::join".to_string()));
    }
}
