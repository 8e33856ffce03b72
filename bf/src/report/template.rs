//! Markdown template slicing.
//!
//! Chapter generation calls the LLM once per section, so the Markdown
//! template has to become a structured section queue first. Lightweight
//! heuristics cover the template shapes in circulation: `# Heading`,
//! `- **1.0 Title**` bullets, and bare `1.1 Title` numbered lines.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Orders climb in steps of ten so a reviewer can splice chapters in
/// between without renumbering.
pub const SECTION_ORDER_STEP: i64 = 10;

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<marker>#{1,6})[ \t]+(?P<title>[^\r\n]+)$").expect("heading"));
static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<marker>[-*+])[ \t]+(?P<title>[^\r\n]+)$").expect("bullet"));
static SLUG_DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^0-9a-zA-Z\u{4e00}-\u{9fff}-]+").expect("slug"));
static DASH_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").expect("dashes"));

/// One sliced template section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSection {
    pub title: String,
    pub slug: String,
    pub order: i64,
    pub depth: u8,
    pub number: String,
    pub chapter_id: String,
    pub outline: Vec<String>,
    #[serde(skip)]
    pub raw_title: String,
}

/// Slice a Markdown template into its top-level sections.
///
/// Each section carries a globally unique slug, a monotonically increasing
/// order and, once all sections are known, a stable `S{n}` chapter id.
/// Lines below a section that classify as outline items attach to it.
pub fn parse_template_sections(template_md: &str) -> Vec<TemplateSection> {
    let mut sections: Vec<TemplateSection> = Vec::new();
    let mut order = SECTION_ORDER_STEP;
    let mut used_slugs = HashSet::new();

    for raw_line in template_md.lines() {
        if raw_line.trim().is_empty() {
            continue;
        }
        let indent = raw_line.len() - raw_line.trim_start_matches(' ').len();
        let stripped = raw_line.trim();

        let Some(meta) = classify_line(stripped, indent) else {
            continue;
        };

        if meta.is_section {
            let slug = ensure_unique_slug(&meta.slug, &mut used_slugs);
            sections.push(TemplateSection {
                title: meta.title,
                slug,
                order,
                depth: meta.depth,
                number: meta.number,
                chapter_id: String::new(),
                outline: Vec::new(),
                raw_title: meta.raw,
            });
            order += SECTION_ORDER_STEP;
        } else if let Some(current) = sections.last_mut() {
            current.outline.push(meta.title);
        }
    }

    for (idx, section) in sections.iter_mut().enumerate() {
        section.chapter_id = format!("S{}", idx + 1);
    }

    sections
}

struct LineMeta {
    is_section: bool,
    depth: u8,
    title: String,
    raw: String,
    number: String,
    slug: String,
}

fn classify_line(stripped: &str, indent: usize) -> Option<LineMeta> {
    if let Some(caps) = HEADING.captures(stripped) {
        let level = caps["marker"].len() as u8;
        let payload = strip_markup(caps["title"].trim());
        let (number, title, display) = split_number(&payload);
        let slug = build_slug(&number, &title);
        return Some(LineMeta {
            is_section: level <= 2,
            depth: level,
            title: display,
            raw: payload,
            number,
            slug,
        });
    }

    if let Some(caps) = BULLET.captures(stripped) {
        let payload = strip_markup(caps["title"].trim());
        let (number, title, display) = split_number(&payload);
        let slug = build_slug(&number, &title);
        let is_section = indent <= 1;
        return Some(LineMeta {
            is_section,
            depth: if is_section { 1 } else { 2 },
            title: display,
            raw: payload,
            number,
            slug,
        });
    }

    // Bare numbered lines: `1.1 市场趋势`
    if let Some((number, label)) = split_leading_number(stripped) {
        if label.is_empty() {
            return None;
        }
        let slug = build_slug(&number, &label);
        let is_section = indent == 0 && number.matches('.').count() <= 1;
        let display = if label.is_empty() {
            number.clone()
        } else {
            format!("{number} {label}")
        };
        return Some(LineMeta {
            is_section,
            depth: if is_section { 1 } else { 2 },
            title: display,
            raw: stripped.to_string(),
            number,
            slug,
        });
    }

    None
}

/// Remove `**`/`__` emphasis wrapping so it does not pollute titles.
fn strip_markup(text: &str) -> String {
    let wrapped = (text.starts_with("**") && text.ends_with("**"))
        || (text.starts_with("__") && text.ends_with("__"));
    if wrapped && text.len() > 4 {
        text[2..text.len() - 2].trim().to_string()
    } else {
        text.to_string()
    }
}

/// Split `1.2 市场趋势` into number, core title, and display form.
fn split_number(payload: &str) -> (String, String, String) {
    match split_leading_number(payload) {
        Some((number, label)) => {
            let display = if label.is_empty() {
                number.clone()
            } else {
                format!("{number} {label}")
            };
            let title = if label.is_empty() { payload.to_string() } else { label };
            (number, title, display)
        }
        None => (String::new(), payload.to_string(), payload.to_string()),
    }
}

/// Parse a leading dotted number (`1`, `1.2`, `2.0`) followed by a
/// separator run, returning the number and the remaining label. A dot only
/// extends the number when a digit follows; `1. Title` reads as number `1`.
fn split_leading_number(text: &str) -> Option<(String, String)> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut number = String::new();

    if i >= chars.len() || !chars[i].is_ascii_digit() {
        return None;
    }
    while i < chars.len() {
        if chars[i].is_ascii_digit() {
            number.push(chars[i]);
            i += 1;
        } else if chars[i] == '.' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit() {
            number.push('.');
            i += 1;
        } else {
            break;
        }
    }

    let is_separator =
        |c: char| matches!(c, ' ' | '\t' | '\u{00A0}' | '\u{3000}' | '、' | ':' | '：' | '-' | '.');
    let mut saw_separator = false;
    while i < chars.len() && is_separator(chars[i]) {
        saw_separator = true;
        i += 1;
    }

    if i >= chars.len() {
        return Some((number, String::new()));
    }
    if !saw_separator {
        // Glued text like `1abc` is not a numbered title.
        return None;
    }
    Some((number, chars[i..].iter().collect::<String>().trim().to_string()))
}

/// Anchor-style slug: reuse the number when present, slugify the title
/// otherwise.
fn build_slug(number: &str, title: &str) -> String {
    let token = if number.is_empty() {
        slugify_text(title)
    } else {
        number.replace('.', "-")
    };
    let token = if token.is_empty() { "section".to_string() } else { token };
    format!("section-{token}")
}

fn slugify_text(text: &str) -> String {
    let replaced = text.replace('·', "-").replace(' ', "-");
    let cleaned = SLUG_DISALLOWED.replace_all(&replaced, "-");
    let collapsed = DASH_RUNS.replace_all(&cleaned, "-");
    collapsed.trim_matches('-').to_lowercase()
}

fn ensure_unique_slug(slug: &str, used: &mut HashSet<String>) -> String {
    if used.insert(slug.to_string()) {
        return slug.to_string();
    }
    let mut idx = 2;
    loop {
        let candidate = format!("{slug}-{idx}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        idx += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headings_become_sections_with_stepped_orders() {
        let template = "# 1.0 总体概述\n\n## 2.0 舆情走势\n\n## 3.0 风险研判\n";
        let sections = parse_template_sections(template);
        assert_eq!(sections.len(), 3);
        let orders: Vec<i64> = sections.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![10, 20, 30]);
        assert_eq!(sections[0].chapter_id, "S1");
        assert_eq!(sections[2].chapter_id, "S3");
    }

    #[test]
    fn test_n_headings_produce_n_sections() {
        let template: String = (1..=7).map(|i| format!("# {i}.0 章节{i}\n")).collect();
        let sections = parse_template_sections(&template);
        assert_eq!(sections.len(), 7);
        let orders: Vec<i64> = sections.iter().map(|s| s.order).collect();
        assert_eq!(orders, (1..=7).map(|i| i * 10).collect::<Vec<i64>>());
    }

    #[test]
    fn test_number_and_slug_extraction() {
        let sections = parse_template_sections("# 1.0 总体概述\n");
        assert_eq!(sections[0].number, "1.0");
        assert_eq!(sections[0].slug, "section-1-0");
        assert_eq!(sections[0].title, "1.0 总体概述");
    }

    #[test]
    fn test_bold_bullet_sections_with_outline() {
        let template = "\
- **1.0 事件回顾**
    - 1.1 时间线梳理
    - 1.2 关键节点
- **2.0 传播分析**
";
        let sections = parse_template_sections(template);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "1.0 事件回顾");
        assert_eq!(sections[0].outline, vec!["1.1 时间线梳理", "1.2 关键节点"]);
        assert!(sections[1].outline.is_empty());
    }

    #[test]
    fn test_bare_numbered_lines() {
        let template = "1.0 背景\n1.1 来源说明\n2.0 结论\n";
        let sections = parse_template_sections(template);
        // A single-dot number at indent 0 still counts as a section.
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].number, "1.0");
    }

    #[test]
    fn test_deep_heading_becomes_outline() {
        let template = "# 1.0 主章节\n### 细分小节\n";
        let sections = parse_template_sections(template);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].outline, vec!["细分小节"]);
    }

    #[test]
    fn test_duplicate_titles_get_unique_slugs() {
        let template = "# 分析\n## 分析\n## 分析\n";
        let sections = parse_template_sections(template);
        let slugs: Vec<&str> = sections.iter().map(|s| s.slug.as_str()).collect();
        assert_eq!(slugs.len(), 3);
        assert_eq!(slugs[0], "section-分析");
        assert_eq!(slugs[1], "section-分析-2");
        assert_eq!(slugs[2], "section-分析-3");
    }

    #[test]
    fn test_dot_separator_number() {
        let (number, label) = split_leading_number("1. 引言").unwrap();
        assert_eq!(number, "1");
        assert_eq!(label, "引言");

        let (number, label) = split_leading_number("2.3.1 细节").unwrap();
        assert_eq!(number, "2.3.1");
        assert_eq!(label, "细节");

        assert!(split_leading_number("abc").is_none());
        assert!(split_leading_number("1abc").is_none());
    }

    #[test]
    fn test_empty_template_yields_no_sections() {
        assert!(parse_template_sections("").is_empty());
        assert!(parse_template_sections("just prose\nwithout structure\n").is_empty());
    }

    #[test]
    fn test_section_serializes_camel_case() {
        let sections = parse_template_sections("# 1.0 概述\n");
        let value = serde_json::to_value(&sections[0]).unwrap();
        assert_eq!(value["chapterId"], "S1");
        assert_eq!(value["order"], 10);
        assert!(value.get("rawTitle").is_none());
    }
}
