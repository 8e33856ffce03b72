//! Log line classification and content extraction.
//!
//! The engines log through two generations of formats: a legacy
//! `[HH:MM:SS]` prefix and the structured
//! `YYYY-MM-DD HH:mm:ss.SSS | LEVEL | module:function:line -` form. Both
//! are handled by the same two-entry timestamp table everywhere lines are
//! parsed.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonrepair::RobustJsonParser;

/// Legacy timestamp prefix: `[HH:MM:SS]`
static TS_LEGACY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\d{2}:\d{2}:\d{2}\]\s*").expect("legacy ts pattern"));

/// Structured prefix: `YYYY-MM-DD HH:mm:ss.SSS | LEVEL | module:function:line -`
static TS_STRUCTURED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}\.\d{3}\s*\|\s*[A-Z]+\s*\|\s*[^|]+?\s-\s*")
        .expect("structured ts pattern")
});

static LOG_LEVEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\|\s*(INFO|ERROR|WARNING|DEBUG|TRACE|CRITICAL)\s*\|").expect("level pattern")
});

static BRACKET_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[^\]]*\]\s*").expect("tag pattern"));
static ENGINE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(INSIGHT|MEDIA|QUERY)\]\s*").expect("engine tag pattern")
});
static ENGINE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(INSIGHT|MEDIA|QUERY)\s+").expect("engine prefix pattern"));
static WHITESPACE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("ws pattern"));

static FORUM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{2}:\d{2}:\d{2})\] \[(INSIGHT|MEDIA|QUERY|HOST|SYSTEM)\] (.*)$")
        .expect("forum line pattern")
});

/// Marker opening a summary-node JSON dump
pub const JSON_START_MARKER: &str = "Cleaned output: {";

/// Lines from these node paths / trigger phrases carry forum material.
const TARGET_NODE_PATTERNS: &[&str] = &[
    "FirstSummaryNode",
    "ReflectionSummaryNode",
    "InsightEngine.nodes.summary_node",
    "MediaEngine.nodes.summary_node",
    "QueryEngine.nodes.summary_node",
    "nodes.summary_node",
    "正在生成首次段落总结",
    "正在生成反思总结",
];

/// Only the first summary opens a session.
const FIRST_SUMMARY_MARKERS: &[&str] = &["FirstSummaryNode", "正在生成首次段落总结"];

/// Error traces must never be mistaken for node output.
const ERROR_KEYWORDS: &[&str] = &["JSON parsing failed", "JSON repair failed", "Traceback", "File \""];

/// Short status chatter excluded from "valuable content".
const EXCLUDE_PATTERNS: &[&str] = &[
    "JSON parsing failed",
    "JSON repair failed",
    "Use the cleaned text directly",
    "JSON parsed successfully",
    "Successfully generated",
    "Paragraph updated",
    "Generating",
    "Start processing",
    "Processing completed",
    "HOST statement has been read",
    "Failed to read HOST statement",
    "HOST speech not found",
    "debug output",
    "information record",
];

/// Minimum cleaned length for a bare line to count as content
const VALUABLE_MIN_CHARS: usize = 30;

/// Source tag of a forum.log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ForumSource {
    Insight,
    Media,
    Query,
    Host,
    System,
}

impl ForumSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForumSource::Insight => "INSIGHT",
            ForumSource::Media => "MEDIA",
            ForumSource::Query => "QUERY",
            ForumSource::Host => "HOST",
            ForumSource::System => "SYSTEM",
        }
    }
}

impl std::fmt::Display for ForumSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed forum.log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForumEntry {
    pub timestamp: String,
    pub source: ForumSource,
    pub content: String,
}

/// Parse a canonical forum.log line. Returns None for anything else.
pub fn parse_forum_line(line: &str) -> Option<ForumEntry> {
    let caps = FORUM_LINE.captures(line)?;
    let source = match &caps[2] {
        "INSIGHT" => ForumSource::Insight,
        "MEDIA" => ForumSource::Media,
        "QUERY" => ForumSource::Query,
        "HOST" => ForumSource::Host,
        _ => ForumSource::System,
    };
    Some(ForumEntry {
        timestamp: caps[1].to_string(),
        source,
        content: caps[3].to_string(),
    })
}

/// Detected log level of a line, if it carries one.
pub fn log_level(line: &str) -> Option<&str> {
    LOG_LEVEL.captures(line).map(|c| match c.get(1) {
        Some(m) => m.as_str(),
        None => "",
    })
    .map(|s| match s {
        "INFO" => "INFO",
        "ERROR" => "ERROR",
        "WARNING" => "WARNING",
        "DEBUG" => "DEBUG",
        "TRACE" => "TRACE",
        _ => "CRITICAL",
    })
}

/// Strip either timestamp form off the front of a line.
pub fn strip_timestamp(line: &str) -> String {
    let stripped = TS_LEGACY.replace(line, "");
    TS_STRUCTURED.replace(&stripped, "").trim().to_string()
}

/// Whether this line was emitted by a summary node we care about.
/// ERROR-level lines and lines carrying error keywords are excluded.
pub fn is_target_line(line: &str) -> bool {
    if log_level(line) == Some("ERROR") || line.contains("| ERROR") {
        return false;
    }
    if ERROR_KEYWORDS.iter().any(|k| line.contains(k)) {
        return false;
    }
    TARGET_NODE_PATTERNS.iter().any(|p| line.contains(p))
}

/// Whether this line should open a new forum session.
pub fn is_first_summary_line(line: &str) -> bool {
    is_target_line(line) && FIRST_SUMMARY_MARKERS.iter().any(|m| line.contains(m))
}

/// Whether a bare target line carries enough substance to record.
pub fn is_valuable_content(line: &str) -> bool {
    if line.contains("Cleaned output") {
        return true;
    }
    if EXCLUDE_PATTERNS.iter().any(|p| line.contains(p)) {
        return false;
    }
    strip_timestamp(line).chars().count() >= VALUABLE_MIN_CHARS
}

/// Whether this line opens a JSON capture.
pub fn is_json_start(line: &str) -> bool {
    line.contains(JSON_START_MARKER)
}

/// Whether a line, with timestamps already stripped, closes a JSON capture.
pub fn is_json_end(cleaned: &str) -> bool {
    cleaned == "}" || cleaned == "] }"
}

/// Strip `[TAG]` markers, engine-name prefixes and squeeze whitespace.
pub fn clean_content_tags(content: &str) -> String {
    let mut cleaned = ENGINE_TAG.replace_all(content, "").into_owned();
    cleaned = ENGINE_PREFIX.replace(&cleaned, "").into_owned();
    while BRACKET_TAG.is_match(&cleaned) {
        cleaned = BRACKET_TAG.replace(&cleaned, "").into_owned();
    }
    WHITESPACE_RUNS.replace_all(&cleaned, " ").trim().to_string()
}

/// Extract node content from a bare target line: timestamps, bracket tags
/// and known prefixes removed.
pub fn extract_node_content(line: &str) -> String {
    let mut content = strip_timestamp(line);
    while BRACKET_TAG.is_match(&content) {
        content = BRACKET_TAG.replace(&content, "").into_owned();
    }
    for prefix in ["First summary:", "Reflection summary:", "Cleaned output:"] {
        if let Some(rest) = content.strip_prefix(prefix) {
            content = rest.to_string();
            break;
        }
    }
    content = ENGINE_PREFIX.replace(&content, "").into_owned();
    WHITESPACE_RUNS.replace_all(&content, " ").trim().to_string()
}

/// Extract the narrative content from a captured JSON burst.
///
/// The first line carries `Cleaned output: {`; continuation lines may be
/// prefixed by either timestamp form. Prefers the reflection key, then the
/// first-summary key, and falls back to the serialized object.
pub fn extract_json_content(lines: &[String], parser: &RobustJsonParser) -> Option<String> {
    let start_idx = lines.iter().position(|l| l.contains(JSON_START_MARKER))?;
    let first_line = &lines[start_idx];
    let json_start = first_line.find(JSON_START_MARKER)?;
    let json_part = &first_line[json_start + "Cleaned output:".len()..];

    let mut json_text = json_part.trim().to_string();
    // Single-line capture: the opening line already closes its braces.
    let single_line = json_text.ends_with('}')
        && json_text.matches('{').count() == json_text.matches('}').count();
    if !single_line {
        for line in &lines[start_idx + 1..] {
            json_text.push_str(&strip_timestamp(line));
        }
    }

    let value = parser.parse(&json_text, "forum capture", &[], None).ok()?;
    Some(format_json_content(&value))
}

fn format_json_content(value: &Value) -> String {
    for key in ["updated_paragraph_latest_state", "paragraph_latest_state"] {
        if let Some(content) = value.get(key).and_then(Value::as_str)
            && !content.is_empty()
        {
            return content.to_string();
        }
    }
    format!(
        "Cleaned output: {}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    )
}
