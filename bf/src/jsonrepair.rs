//! Tolerant JSON parsing for LLM output.
//!
//! Everything the LLMs return that must be structured goes through this
//! cascade: clean the wrapper noise, apply local syntax repairs, fall back
//! to a lenient third-party parser, and finally (if enabled) ask another
//! LLM to fix its sibling's mistakes. Success at any stage returns
//! immediately; input that was already valid JSON comes back byte-for-byte
//! equivalent to a plain parse of the inner content.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

/// How much raw text the error carries in its message. The full text is
/// still available on the error for quarantining.
const RAW_PREVIEW_CHARS: usize = 500;

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").expect("fence pattern"));
static THINKING_TAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?si)^\s*<(thinking|thought)>.*?</(thinking|thought)>\s*").expect("thinking pattern")
});
static COLON_EQUALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(":\s*)="#).expect("colon-equals pattern"));
static TRIPLE_CLOSE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\]\s*\]\s*\]\s*,\s*\[\s*\[").expect("bracket pattern"));
static TRIPLE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\s*\[\s*\[").expect("bracket pattern"));
static TRIPLE_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\]\s*\]\s*\]").expect("bracket pattern"));

/// Alias table for keys the LLMs habitually rename.
static KEY_ALIASES: LazyLock<HashMap<&'static str, &'static [&'static str]>> = LazyLock::new(|| {
    HashMap::from([
        ("template_name", &["templateName", "name", "template"][..]),
        ("selection_reason", &["selectionReason", "reason", "explanation"][..]),
        ("title", &["reportTitle", "documentTitle"][..]),
        ("chapters", &["chapterList", "chapterPlan", "sections"][..]),
        ("totalWords", &["total_words", "wordCount", "totalWordCount"][..]),
    ])
});

/// Raised when every stage of the cascade has failed. Carries the complete
/// raw text so the caller can quarantine it.
#[derive(Debug, thiserror::Error)]
#[error("{context} JSON parse failed: {message} (raw starts: {preview})")]
pub struct ParseError {
    pub context: String,
    pub message: String,
    pub raw: String,
    preview: String,
}

impl ParseError {
    fn new(context: &str, message: impl Into<String>, raw: &str) -> Self {
        let message = message.into();
        let preview: String = raw.chars().take(RAW_PREVIEW_CHARS).collect();
        Self {
            context: context.to_string(),
            message,
            raw: raw.to_string(),
            preview,
        }
    }
}

/// Optional last-resort repair hook: takes (raw text, parse error message),
/// returns a hopefully-fixed JSON string.
pub type LlmRepairFn = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

/// Robust JSON parser combining cleaning, local repair, a lenient
/// third-party parser, and an optional LLM repair hook.
pub struct RobustJsonParser {
    llm_repair: Option<LlmRepairFn>,
    enable_library_repair: bool,
    enable_llm_repair: bool,
}

impl Default for RobustJsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RobustJsonParser {
    pub fn new() -> Self {
        Self {
            llm_repair: None,
            enable_library_repair: true,
            enable_llm_repair: false,
        }
    }

    /// Install the LLM repair hook and enable that stage.
    pub fn with_llm_repair(mut self, repair: LlmRepairFn) -> Self {
        self.llm_repair = Some(repair);
        self.enable_llm_repair = true;
        self
    }

    pub fn with_library_repair(mut self, enable: bool) -> Self {
        self.enable_library_repair = enable;
        self
    }

    /// Parse LLM output into a JSON object.
    ///
    /// `expected_keys` drives list-element selection and alias recovery;
    /// `wrapper_key` unwraps `{"wrapper": {...}}` shells.
    pub fn parse(
        &self,
        raw: &str,
        context: &str,
        expected_keys: &[&str],
        wrapper_key: Option<&str>,
    ) -> Result<Value, ParseError> {
        if raw.trim().is_empty() {
            return Err(ParseError::new(context, "empty response", raw));
        }

        let candidates = build_candidates(raw);
        let mut last_error: Option<String> = None;

        for (i, candidate) in candidates.iter().enumerate() {
            match serde_json::from_str::<Value>(candidate) {
                Ok(data) => {
                    debug!(context, candidate = i + 1, "parsed");
                    return extract_and_validate(data, expected_keys, wrapper_key, context, raw);
                }
                Err(e) => {
                    debug!(context, candidate = i + 1, error = %e, "candidate failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        // Lenient third-party stage: tolerates unquoted keys, single quotes
        // and comments, which the local repairs deliberately do not touch.
        if self.enable_library_repair {
            for candidate in candidates.iter().rev() {
                match serde_json5::from_str::<Value>(candidate) {
                    Ok(data) => {
                        info!(context, "recovered through lenient parser");
                        return extract_and_validate(data, expected_keys, wrapper_key, context, raw);
                    }
                    Err(e) => {
                        debug!(context, error = %e, "lenient parse failed");
                        last_error = Some(e.to_string());
                    }
                }
            }
        }

        if self.enable_llm_repair
            && let Some(repair) = &self.llm_repair
        {
            let cleaned = candidates.first().map(String::as_str).unwrap_or(raw);
            let error_msg = last_error.clone().unwrap_or_default();
            info!(context, "attempting LLM repair");
            if let Some(fixed) = repair(cleaned, &error_msg) {
                match serde_json::from_str::<Value>(&fixed) {
                    Ok(data) => {
                        info!(context, "recovered through LLM repair");
                        return extract_and_validate(data, expected_keys, wrapper_key, context, raw);
                    }
                    Err(e) => {
                        warn!(context, error = %e, "LLM repair output still unparseable");
                        last_error = Some(e.to_string());
                    }
                }
            }
        }

        Err(ParseError::new(
            context,
            last_error.unwrap_or_else(|| "no parse candidate".to_string()),
            raw,
        ))
    }
}

/// Cleaning strategies, most conservative first.
fn build_candidates(raw: &str) -> Vec<String> {
    let cleaned = clean_response(raw);
    let mut candidates = vec![cleaned.clone()];

    let repaired = apply_local_repairs(&cleaned);
    if repaired != cleaned {
        candidates.push(repaired.clone());
    }

    let flattened = flatten_nested_arrays(&repaired);
    if !candidates.contains(&flattened) {
        candidates.push(flattened);
    }

    candidates
}

/// Strip thinking tags and markdown fences, then cut the first balanced
/// JSON structure out of whatever prose surrounds it.
fn clean_response(raw: &str) -> String {
    let mut cleaned = raw.trim().to_string();

    cleaned = THINKING_TAGS.replace(&cleaned, "").into_owned();

    if let Some(caps) = FENCED_BLOCK.captures(&cleaned) {
        cleaned = caps[1].trim().to_string();
    } else {
        if let Some(rest) = cleaned.strip_prefix("```json") {
            cleaned = rest.to_string();
        } else if let Some(rest) = cleaned.strip_prefix("```") {
            cleaned = rest.to_string();
        }
        if let Some(rest) = cleaned.strip_suffix("```") {
            cleaned = rest.to_string();
        }
        cleaned = cleaned.trim().to_string();
    }

    extract_first_json_structure(&cleaned)
}

/// Extract the first complete `{...}` or `[...]` from text, respecting
/// string and escape state. Returns the input when no structure is found.
fn extract_first_json_structure(text: &str) -> String {
    let bytes: Vec<char> = text.chars().collect();
    let start = match bytes.iter().position(|&c| c == '{' || c == '[') {
        Some(pos) => pos,
        None => return text.to_string(),
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return bytes[start..=i].iter().collect();
                }
            }
            _ => {}
        }
    }

    // Unterminated structure: hand the tail to the repair stages.
    bytes[start..].iter().collect()
}

/// Local syntax repairs, each idempotent and safe to apply in sequence.
fn apply_local_repairs(text: &str) -> String {
    let mut repaired = text.to_string();

    let fixed = COLON_EQUALS.replace_all(&repaired, "$1").into_owned();
    if fixed != repaired {
        warn!("removed ':=' artifact from JSON");
        repaired = fixed;
    }

    let (fixed, changed) = escape_control_characters(&repaired);
    if changed {
        warn!("escaped bare control characters inside string literals");
        repaired = fixed;
    }

    let (fixed, changed) = fix_missing_commas(&repaired);
    if changed {
        warn!("inserted missing commas between value tokens");
        repaired = fixed;
    }

    let (fixed, changed) = collapse_redundant_brackets(&repaired);
    if changed {
        warn!("collapsed over-nested brackets");
        repaired = fixed;
    }

    let (fixed, changed) = balance_brackets(&repaired);
    if changed {
        warn!("rebalanced brackets");
        repaired = fixed;
    }

    let (fixed, changed) = remove_trailing_commas(&repaired);
    if changed {
        warn!("removed trailing commas");
        repaired = fixed;
    }

    repaired
}

/// Replace naked newlines/tabs/control characters inside string literals
/// with their escape sequences.
fn escape_control_characters(text: &str) -> (String, bool) {
    let mut result = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut mutated = false;

    for ch in text.chars() {
        if escaped {
            result.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                result.push(ch);
                escaped = true;
            }
            '"' => {
                result.push(ch);
                in_string = !in_string;
            }
            '\n' if in_string => {
                result.push_str("\\n");
                mutated = true;
            }
            '\r' if in_string => {
                result.push_str("\\r");
                mutated = true;
            }
            '\t' if in_string => {
                result.push_str("\\t");
                mutated = true;
            }
            c if in_string && (c as u32) < 0x20 => {
                result.push_str(&format!("\\u{:04x}", c as u32));
                mutated = true;
            }
            c => result.push(c),
        }
    }

    (result, mutated)
}

/// Insert commas between adjacent value tokens (closing brace/bracket,
/// closing quote, digit) and a following opener (`{`, `[`, `"`), but only
/// inside an open structure so concatenated documents stay separate.
fn fix_missing_commas(text: &str) -> (String, bool) {
    let mut result = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut mutated = false;
    let mut depth: i64 = 0;
    // Last significant character outside of strings (closing quotes count).
    let mut last_token_end: Option<char> = None;

    for ch in text.chars() {
        if in_string {
            result.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                last_token_end = Some('"');
            }
            continue;
        }

        match ch {
            '"' | '{' | '[' => {
                let value_ended = matches!(last_token_end, Some('"' | '}' | ']'))
                    || last_token_end.is_some_and(|c| c.is_ascii_digit());
                if value_ended && depth > 0 {
                    result.push(',');
                    mutated = true;
                }
                result.push(ch);
                match ch {
                    '"' => in_string = true,
                    _ => {
                        depth += 1;
                        last_token_end = None;
                    }
                }
            }
            '}' | ']' => {
                depth -= 1;
                result.push(ch);
                last_token_end = Some(ch);
            }
            c if c.is_whitespace() => result.push(c),
            c => {
                result.push(c);
                last_token_end = Some(c);
            }
        }
    }

    (result, mutated)
}

/// Fold three levels of consecutive brackets down to two; LLMs regularly
/// add a phantom dimension to table/list payloads.
fn collapse_redundant_brackets(text: &str) -> (String, bool) {
    let mut repaired = text.to_string();
    let mut mutated = false;

    for (pattern, replacement) in [
        (&*TRIPLE_CLOSE_OPEN, "]],["),
        (&*TRIPLE_OPEN, "[["),
        (&*TRIPLE_CLOSE, "]]"),
    ] {
        let fixed = pattern.replace_all(&repaired, replacement).into_owned();
        if fixed != repaired {
            mutated = true;
            repaired = fixed;
        }
    }

    (repaired, mutated)
}

fn flatten_nested_arrays(text: &str) -> String {
    let once = TRIPLE_CLOSE.replace_all(text, "]]").into_owned();
    TRIPLE_OPEN.replace_all(&once, "[[").into_owned()
}

/// Drop unmatched closers and append missing closers at EOF, tracked by a
/// bracket stack that ignores string content.
fn balance_brackets(text: &str) -> (String, bool) {
    let mut result = String::with_capacity(text.len());
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut mutated = false;

    for ch in text.chars() {
        if escaped {
            result.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                result.push(ch);
                escaped = true;
            }
            '"' => {
                result.push(ch);
                in_string = !in_string;
            }
            '{' | '[' if !in_string => {
                stack.push(ch);
                result.push(ch);
            }
            '}' if !in_string => {
                if stack.last() == Some(&'{') {
                    stack.pop();
                    result.push(ch);
                } else {
                    mutated = true;
                }
            }
            ']' if !in_string => {
                if stack.last() == Some(&'[') {
                    stack.pop();
                    result.push(ch);
                } else {
                    mutated = true;
                }
            }
            c => result.push(c),
        }
    }

    while let Some(opener) = stack.pop() {
        result.push(if opener == '{' { '}' } else { ']' });
        mutated = true;
    }

    (result, mutated)
}

/// Remove commas that sit directly before a closing brace or bracket.
fn remove_trailing_commas(text: &str) -> (String, bool) {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut mutated = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if in_string {
            result.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if ch == '"' {
            in_string = true;
            result.push(ch);
            i += 1;
            continue;
        }
        if ch == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                mutated = true;
                i += 1;
                continue;
            }
        }
        result.push(ch);
        i += 1;
    }

    (result, mutated)
}

/// Unwrap, shape-check and alias-recover a parsed value into the object the
/// caller expects.
fn extract_and_validate(
    mut data: Value,
    expected_keys: &[&str],
    wrapper_key: Option<&str>,
    context: &str,
    raw: &str,
) -> Result<Value, ParseError> {
    if let Some(key) = wrapper_key
        && let Some(obj) = data.as_object()
    {
        if let Some(inner) = obj.get(key) {
            data = inner.clone();
        } else {
            warn!(context, key, "wrapper key not present, using value as-is");
        }
    }

    if data.is_array() {
        let items = data.as_array().expect("checked array");
        if items.is_empty() {
            return Err(ParseError::new(context, "empty array where object expected", raw));
        }
        let mut best: Option<(&Value, usize)> = None;
        for item in items {
            if let Some(obj) = item.as_object() {
                let matches = expected_keys.iter().filter(|k| obj.contains_key(**k)).count();
                if best.is_none_or(|(_, score)| matches > score) {
                    best = Some((item, matches));
                }
            }
        }
        match best {
            Some((item, matches)) => {
                warn!(
                    context,
                    matched = matches,
                    expected = expected_keys.len(),
                    "array returned where object expected, picked best-matching element"
                );
                data = item.clone();
            }
            None => {
                return Err(ParseError::new(context, "array contains no object element", raw));
            }
        }
    }

    let Some(obj) = data.as_object_mut() else {
        return Err(ParseError::new(
            context,
            format!("expected object, got {}", value_kind(&data)),
            raw,
        ));
    };

    for key in expected_keys {
        if obj.contains_key(*key) {
            continue;
        }
        if let Some(aliases) = KEY_ALIASES.get(key) {
            for alias in *aliases {
                if let Some(value) = obj.get(*alias).cloned() {
                    info!(context, key, alias, "recovered missing key through alias");
                    obj.insert((*key).to_string(), value);
                    break;
                }
            }
        }
        if !obj.contains_key(*key) {
            warn!(context, key, "expected key missing after alias recovery");
        }
    }

    Ok(data)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> RobustJsonParser {
        RobustJsonParser::new()
    }

    #[test]
    fn test_plain_json_passes_through() {
        let result = parser().parse(r#"{"a": 1, "b": [2, 3]}"#, "test", &[], None).unwrap();
        assert_eq!(result, json!({"a": 1, "b": [2, 3]}));
    }

    #[test]
    fn test_fenced_json_equals_inner_parse() {
        let inner = r#"{"title": "市政热点", "order": 10}"#;
        let wrapped = format!("Here is the result:\n```json\n{inner}\n```\nDone.");
        let result = parser().parse(&wrapped, "test", &[], None).unwrap();
        assert_eq!(result, serde_json::from_str::<Value>(inner).unwrap());
    }

    #[test]
    fn test_thinking_preamble_stripped() {
        let raw = "<thinking>let me work this out</thinking>{\"x\": 1}";
        let result = parser().parse(raw, "test", &[], None).unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[test]
    fn test_prose_before_and_after() {
        let raw = "Sure! The plan is {\"chapters\": []} as requested.";
        let result = parser().parse(raw, "test", &[], None).unwrap();
        assert_eq!(result, json!({"chapters": []}));
    }

    #[test]
    fn test_missing_comma_between_pairs() {
        let result = parser().parse(r#"{"a": 1 "b": 2}"#, "test", &[], None).unwrap();
        assert_eq!(result, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_missing_comma_between_objects() {
        let result = parser()
            .parse(r#"{"rows": [{"x": 1} {"x": 2}]}"#, "test", &[], None)
            .unwrap();
        assert_eq!(result, json!({"rows": [{"x": 1}, {"x": 2}]}));
    }

    #[test]
    fn test_colon_equals_artifact() {
        let result = parser().parse(r#"{"a":= 1}"#, "test", &[], None).unwrap();
        assert_eq!(result, json!({"a": 1}));
    }

    #[test]
    fn test_bare_newline_in_string() {
        let raw = "{\"text\": \"line one\nline two\"}";
        let result = parser().parse(raw, "test", &[], None).unwrap();
        assert_eq!(result["text"], "line one\nline two");
    }

    #[test]
    fn test_over_nested_brackets_collapse() {
        // Unbalanced triple-nesting: collapsing one level makes it parse.
        let raw = r#"{"items": [[[1]]}"#;
        let result = parser().parse(raw, "test", &[], None).unwrap();
        assert_eq!(result, json!({"items": [[1]]}));
    }

    #[test]
    fn test_valid_deep_nesting_untouched() {
        let raw = r#"{"items": [[[1]]]}"#;
        let result = parser().parse(raw, "test", &[], None).unwrap();
        assert_eq!(result, json!({"items": [[[1]]]}));
    }

    #[test]
    fn test_unclosed_brackets_completed() {
        let raw = r#"{"a": [1, 2"#;
        let result = parser().parse(raw, "test", &[], None).unwrap();
        assert_eq!(result, json!({"a": [1, 2]}));
    }

    #[test]
    fn test_stray_closer_dropped() {
        let raw = r#"{"a": 1}]"#;
        let result = parser().parse(raw, "test", &[], None).unwrap();
        assert_eq!(result, json!({"a": 1}));
    }

    #[test]
    fn test_trailing_comma_removed() {
        let result = parser().parse(r#"{"a": 1, "b": [1, 2,],}"#, "test", &[], None).unwrap();
        assert_eq!(result, json!({"a": 1, "b": [1, 2]}));
    }

    #[test]
    fn test_trailing_comma_inside_string_untouched() {
        let result = parser().parse(r#"{"a": "x,}"}"#, "test", &[], None).unwrap();
        assert_eq!(result["a"], "x,}");
    }

    #[test]
    fn test_library_stage_handles_unquoted_keys() {
        let result = parser().parse(r#"{title: 'report', order: 10}"#, "test", &[], None).unwrap();
        assert_eq!(result, json!({"title": "report", "order": 10}));
    }

    #[test]
    fn test_wrapper_key_unwrapped() {
        let raw = r#"{"result": {"template_name": "standard"}}"#;
        let result = parser().parse(raw, "test", &[], Some("result")).unwrap();
        assert_eq!(result, json!({"template_name": "standard"}));
    }

    #[test]
    fn test_list_picks_best_matching_object() {
        let raw = r#"[{"noise": true}, {"template_name": "a", "template_content": "b"}]"#;
        let result = parser()
            .parse(raw, "test", &["template_name", "template_content"], None)
            .unwrap();
        assert_eq!(result["template_name"], "a");
    }

    #[test]
    fn test_alias_recovery() {
        let raw = r#"{"templateName": "standard", "reason": "fits"}"#;
        let result = parser()
            .parse(raw, "test", &["template_name", "selection_reason"], None)
            .unwrap();
        assert_eq!(result["template_name"], "standard");
        assert_eq!(result["selection_reason"], "fits");
    }

    #[test]
    fn test_empty_input_fails() {
        let err = parser().parse("   ", "test", &[], None).unwrap_err();
        assert!(err.message.contains("empty"));
    }

    #[test]
    fn test_exhaustion_carries_raw_text() {
        let raw = "completely unstructured prose with no json at all";
        let err = parser().parse(raw, "test", &[], None).unwrap_err();
        assert_eq!(err.raw, raw);
        assert_eq!(err.context, "test");
    }

    #[test]
    fn test_llm_repair_stage() {
        let repair: LlmRepairFn = Arc::new(|_raw, _err| Some(r#"{"fixed": true}"#.to_string()));
        let parser = RobustJsonParser::new()
            .with_library_repair(false)
            .with_llm_repair(repair);
        let result = parser.parse("@@garbage@@ not json", "test", &[], None);
        // The cleaner finds no structure, so repair receives the prose and
        // the hook's output wins.
        assert_eq!(result.unwrap(), json!({"fixed": true}));
    }

    #[test]
    fn test_llm_repair_disabled_by_default() {
        let result = parser().parse("@@garbage@@ not json", "test", &[], None);
        assert!(result.is_err());
    }

    #[test]
    fn test_concatenated_documents_not_merged() {
        // Two complete top-level documents: only the first is extracted,
        // no comma is invented between them.
        let raw = r#"{"a": 1} {"b": 2}"#;
        let result = parser().parse(raw, "test", &[], None).unwrap();
        assert_eq!(result, json!({"a": 1}));
    }

    #[test]
    fn test_local_repairs_idempotent() {
        let raw = r#"{"a": 1 "b": [1, 2,]"#;
        let once = apply_local_repairs(raw);
        let twice = apply_local_repairs(&once);
        assert_eq!(once, twice);
    }
}
