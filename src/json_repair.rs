//! JSON repair ladder for LLM output
//!
//! LLM responses should be JSON but frequently are not clean. The parser
//! applies repair strategies in a fixed order until one yields valid JSON:
//!
//! 1. Preprocess (control characters, thinking tags) + direct parse
//! 2. Markdown code-fence extraction
//! 3. Outermost `{...}` / `[...]` extraction
//! 4. Common syntax repair (trailing commas, line comments, missing commas,
//!    raw newlines inside strings)
//! 5. Single-quote to double-quote conversion
//! 6. Line-by-line heuristic repair
//! 7. Partial extraction of a known array field (`"findings"`, `"results"`)
//! 8. Truncation completion (append missing closing brackets)
//! 9. Aggressive truncation repair (close an unterminated string first)
//! 10. Role-specific regex field extraction
//!
//! Callers that exhaust the ladder fall back to a role-appropriate
//! conservative default.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// A named regex used by strategy 10 to synthesise a minimal object
pub struct FieldPattern {
    pub field: &'static str,
    pub pattern: &'static str,
}

/// Verifier fields: conclusion / confidence / final_severity
pub const VERIFIER_FIELDS: &[FieldPattern] = &[
    FieldPattern {
        field: "conclusion",
        pattern: r#""?conclusion"?\s*[:=]\s*"?(confirmed|false_positive|needs_review)"#,
    },
    FieldPattern {
        field: "confidence",
        pattern: r#""?confidence"?\s*[:=]\s*"?(\d{1,3})"#,
    },
    FieldPattern {
        field: "final_severity",
        pattern: r#""?final_severity"?\s*[:=]\s*"?(critical|high|medium|low|none)"#,
    },
    FieldPattern {
        field: "reasoning",
        pattern: r#""?reasoning"?\s*[:=]\s*"([^"]{1,400})"#,
    },
];

/// WhiteHat fields: is_exploitable / confidence / exploitability_score
pub const WHITEHAT_FIELDS: &[FieldPattern] = &[
    FieldPattern {
        field: "is_exploitable",
        pattern: r#""?is_exploitable"?\s*[:=]\s*"?(true|false)"#,
    },
    FieldPattern {
        field: "confidence",
        pattern: r#""?confidence"?\s*[:=]\s*"?(\d{1,3}|high|medium|low|theoretical)"#,
    },
    FieldPattern {
        field: "exploitability_score",
        pattern: r#""?exploitability_score"?\s*[:=]\s*"?(\d{1,2}(?:\.\d+)?)"#,
    },
    FieldPattern {
        field: "exploit_reasoning",
        pattern: r#""?exploit_reasoning"?\s*[:=]\s*"([^"]{1,400})"#,
    },
];

/// Parse LLM output into JSON, applying the full ladder.
/// `field_patterns` powers the final role-specific extraction; pass an
/// empty slice when no role patterns apply.
pub fn robust_parse_json(text: &str, field_patterns: &[FieldPattern]) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    let cleaned = preprocess(text);

    // 1. direct
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return Some(value);
    }

    // 2. code fences
    if let Some(candidate) = extract_from_fences(&cleaned) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            return Some(value);
        }
        // the fenced block is the best candidate for later repairs
        if let Some(value) = repair_candidates(&candidate) {
            return Some(value);
        }
    }

    // 3. outermost braces
    let candidate = extract_balanced(&cleaned).unwrap_or_else(|| cleaned.clone());
    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return Some(value);
    }

    // 4-9
    if let Some(value) = repair_candidates(&candidate) {
        return Some(value);
    }

    // 10. role-specific field extraction
    let extracted = extract_fields(&cleaned, field_patterns);
    if !extracted.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        debug!("json ladder fell through to field extraction");
        return Some(extracted);
    }

    None
}

/// Strategies 4-9 over one candidate string
fn repair_candidates(candidate: &str) -> Option<Value> {
    // 4. common syntax repair
    let repaired = repair_common_issues(candidate);
    if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
        return Some(value);
    }

    // 5. single quotes
    let requoted = requote_single_quotes(&repaired);
    if let Ok(value) = serde_json::from_str::<Value>(&requoted) {
        return Some(value);
    }

    // 6. line-by-line repair
    let line_fixed = repair_lines(&repaired);
    if let Ok(value) = serde_json::from_str::<Value>(&line_fixed) {
        return Some(value);
    }

    // 7. partial array extraction
    for field in ["findings", "results"] {
        if let Some(array) = extract_array_field(candidate, field) {
            return Some(serde_json::json!({ field: array }));
        }
    }

    // 8. truncation completion
    let completed = complete_truncated(&repaired, false);
    if let Ok(value) = serde_json::from_str::<Value>(&completed) {
        return Some(value);
    }

    // 9. aggressive: close an unterminated string first
    let completed = complete_truncated(&repaired, true);
    if let Ok(value) = serde_json::from_str::<Value>(&completed) {
        return Some(value);
    }

    None
}

/// Strip control characters and inline thinking tags
fn preprocess(text: &str) -> String {
    static THINK_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?s)<(thinking|think|reasoning)>.*?</(thinking|think|reasoning)>")
            .expect("think tag regex")
    });
    let without_tags = THINK_RE.replace_all(text, "");
    without_tags
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Extract the first ```json ...``` or ``` ... ``` block
fn extract_from_fences(text: &str) -> Option<String> {
    static FENCE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").expect("fence regex"));
    FENCE_RE
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
}

/// Extract the outermost balanced `{...}` or `[...]`, string-aware
pub fn extract_balanced(text: &str) -> Option<String> {
    let start = text.find(|c| c == '{' || c == '[')?;
    let open = text.as_bytes()[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, byte) in text.bytes().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b if b == open && !in_string => depth += 1,
            b if b == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Fix trailing commas, `//` comments, missing commas between elements and
/// raw newlines inside string values (pasted Move code is the usual cause).
fn repair_common_issues(text: &str) -> String {
    static TRAILING_COMMA_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r",\s*([}\]])").expect("trailing comma regex"));
    static LINE_COMMENT_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?m)^\s*//[^\n]*$").expect("line comment regex"));
    static MISSING_COMMA_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"([}\]"])\s*\n(\s*["{\[])"#).expect("missing comma regex"));

    let mut repaired = escape_raw_newlines_in_strings(text);
    repaired = LINE_COMMENT_RE.replace_all(&repaired, "").to_string();
    repaired = TRAILING_COMMA_RE.replace_all(&repaired, "$1").to_string();
    repaired = MISSING_COMMA_RE.replace_all(&repaired, "$1,\n$2").to_string();
    repaired
}

/// Replace literal newlines that occur inside string values with `\n`
fn escape_raw_newlines_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => {
                out.push(c);
                escaped = true;
            }
            '"' => {
                out.push(c);
                in_string = !in_string;
            }
            '\n' if in_string => out.push_str("\\n"),
            '\t' if in_string => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Convert single-quoted keys/values into double-quoted ones
fn requote_single_quotes(text: &str) -> String {
    static SQ_KEY_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"'([A-Za-z_][\w ]*)'\s*:").expect("sq key regex"));
    static SQ_VALUE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r":\s*'([^']*)'").expect("sq value regex"));
    let keys = SQ_KEY_RE.replace_all(text, "\"$1\":");
    SQ_VALUE_RE.replace_all(&keys, ": \"$1\"").to_string()
}

/// Per-line repair: quote bare keys and drop unparsable decoration lines
fn repair_lines(text: &str) -> String {
    static BARE_KEY_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(\s*)([A-Za-z_]\w*)\s*:").expect("bare key regex"));
    text.lines()
        .filter(|line| {
            let trimmed = line.trim();
            // Drop markdown decoration that sneaks between JSON lines
            !(trimmed.starts_with("```") || trimmed.starts_with('#') || trimmed.starts_with('*'))
        })
        .map(|line| BARE_KEY_RE.replace(line, "$1\"$2\":").to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Locate `"<field>": [...]` and parse the array even when the outer object
/// is broken. Repairs the array with the earlier strategies if needed.
fn extract_array_field(text: &str, field: &str) -> Option<Value> {
    let marker = format!("\"{field}\"");
    let field_pos = text.find(&marker)?;
    let after = &text[field_pos + marker.len()..];
    let bracket = after.find('[')?;
    let candidate = extract_balanced(&after[bracket..])?;
    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return Some(value);
    }
    let repaired = repair_common_issues(&candidate);
    serde_json::from_str::<Value>(&repaired).ok()
}

/// Append the closing brackets a truncated response is missing.
/// With `close_string`, first terminate an unterminated string value.
fn complete_truncated(text: &str, close_string: bool) -> String {
    let mut out = text.trim_end().to_string();

    // Count bracket depth outside strings
    let mut in_string = false;
    let mut escaped = false;
    let mut stack = Vec::new();
    for c in out.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    if in_string {
        if !close_string {
            return out;
        }
        out.push('"');
    }
    // A dangling comma or key-colon before the closers breaks the parse
    let trimmed = out.trim_end().to_string();
    out = trimmed;
    while out.ends_with(',') || out.ends_with(':') {
        out.pop();
        out = out.trim_end().to_string();
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Strategy 10: synthesise a minimal object from role-specific patterns
fn extract_fields(text: &str, patterns: &[FieldPattern]) -> Value {
    let mut object = serde_json::Map::new();
    for fp in patterns {
        let Ok(re) = Regex::new(&format!("(?i){}", fp.pattern)) else {
            continue;
        };
        if let Some(caps) = re.captures(text) {
            let raw = caps[1].to_string();
            let value = if let Ok(n) = raw.parse::<i64>() {
                Value::from(n)
            } else if let Ok(f) = raw.parse::<f64>() {
                Value::from(f)
            } else if raw == "true" || raw == "false" {
                Value::from(raw == "true")
            } else {
                Value::from(raw)
            };
            object.insert(fp.field.to_string(), value);
        }
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_parse() {
        let value = robust_parse_json(r#"{"a": 1}"#, &[]).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn fenced_json() {
        let text = "Here is the result:\n```json\n{\"conclusion\": \"confirmed\"}\n```\nDone.";
        let value = robust_parse_json(text, &[]).unwrap();
        assert_eq!(value["conclusion"], "confirmed");
    }

    #[test]
    fn thinking_tags_are_stripped() {
        let text = "<thinking>let me think { broken</thinking>{\"ok\": true}";
        let value = robust_parse_json(text, &[]).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn trailing_commas_repaired() {
        let text = r#"{"items": [1, 2, 3,], "done": true,}"#;
        let value = robust_parse_json(text, &[]).unwrap();
        assert_eq!(value["items"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn raw_newlines_in_code_strings_repaired() {
        let text = "{\"evidence\": \"fun repay() {\n    abort 0\n}\"}";
        let value = robust_parse_json(text, &[]).unwrap();
        assert!(value["evidence"].as_str().unwrap().contains("abort 0"));
    }

    #[test]
    fn single_quotes_requoted() {
        let text = "{'conclusion': 'false_positive', 'confidence': 90}";
        let value = robust_parse_json(text, &[]).unwrap();
        assert_eq!(value["conclusion"], "false_positive");
    }

    #[test]
    fn partial_findings_array_extracted() {
        let text = r#"The response was cut {"meta": oops, "findings": [{"id": "V-1", "title": "x"}], garbage"#;
        let value = robust_parse_json(text, &[]).unwrap();
        assert_eq!(value["findings"][0]["id"], "V-1");
    }

    #[test]
    fn truncated_object_completed() {
        let text = r#"{"results": [{"vuln_index": 1, "conclusion": "confirmed""#;
        let value = robust_parse_json(text, &[]).unwrap();
        assert_eq!(value["results"][0]["conclusion"], "confirmed");
    }

    #[test]
    fn unterminated_string_completed() {
        let text = r#"{"reasoning": "the check is miss"#;
        let value = robust_parse_json(text, &[]).unwrap();
        assert!(value["reasoning"].as_str().unwrap().starts_with("the check"));
    }

    #[test]
    fn verifier_field_extraction_as_last_resort() {
        let text = "I think conclusion: confirmed with confidence: 85 and final_severity: high overall";
        let value = robust_parse_json(text, &VERIFIER_FIELDS).unwrap();
        assert_eq!(value["conclusion"], "confirmed");
        assert_eq!(value["confidence"], 85);
        assert_eq!(value["final_severity"], "high");
    }

    #[test]
    fn whitehat_field_extraction() {
        let text = "is_exploitable: true, exploitability_score: 8, confidence: high";
        let value = robust_parse_json(text, &WHITEHAT_FIELDS).unwrap();
        assert_eq!(value["is_exploitable"], true);
        assert_eq!(value["exploitability_score"], 8);
    }

    #[test]
    fn hopeless_text_returns_none() {
        assert!(robust_parse_json("no json anywhere here", &[]).is_none());
        assert!(robust_parse_json("", &[]).is_none());
    }
}
