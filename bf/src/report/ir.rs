//! Document IR vocabulary: the closed sets renderers rely on.

use std::collections::HashMap;
use std::sync::LazyLock;

/// Schema version stamped into every Document IR
pub const IR_VERSION: &str = "1.0";

/// Every block type a chapter may contain
pub const ALLOWED_BLOCK_TYPES: &[&str] = &[
    "heading",
    "paragraph",
    "list",
    "table",
    "swotTable",
    "pestTable",
    "blockquote",
    "engineQuote",
    "callout",
    "kpiGrid",
    "widget",
    "code",
    "math",
    "figure",
    "hr",
    "toc",
];

/// Inline run marks
pub const ALLOWED_INLINE_MARKS: &[&str] = &[
    "bold",
    "italic",
    "underline",
    "strike",
    "code",
    "link",
    "color",
    "font",
    "highlight",
    "subscript",
    "superscript",
    "math",
];

/// Rating scale for SWOT impact fields
pub const ALLOWED_IMPACT_VALUES: &[&str] = &["低", "中低", "中", "中高", "高", "极高"];

/// Callout tones
pub const ALLOWED_CALLOUT_TONES: &[&str] = &["info", "warning", "success", "danger"];

/// List types
pub const ALLOWED_LIST_TYPES: &[&str] = &["ordered", "bullet", "task"];

/// Fixed display title per engine quote source
pub static ENGINE_AGENT_TITLES: LazyLock<HashMap<&'static str, &'static str>> =
    LazyLock::new(|| {
        HashMap::from([
            ("insight", "Insight Agent"),
            ("media", "Media Agent"),
            ("query", "Query Agent"),
        ])
    });
