//! Minimal HTML rendering of a Document IR.
//!
//! The production renderers are pluggable collaborators; this one keeps
//! the result endpoint useful by covering the common block types with
//! clean semantic HTML. Visual design is explicitly not its job.

use serde_json::Value;

/// Render a full Document IR to a standalone HTML page.
pub fn render_html(document: &Value) -> String {
    let title = document
        .pointer("/metadata/title")
        .and_then(Value::as_str)
        .unwrap_or("舆情分析报告");

    let mut body = String::new();
    body.push_str(&format!("<h1>{}</h1>\n", escape(title)));

    if let Some(subtitle) = document.pointer("/metadata/subtitle").and_then(Value::as_str) {
        body.push_str(&format!("<p class=\"subtitle\">{}</p>\n", escape(subtitle)));
    }

    if let Some(chapters) = document.get("chapters").and_then(Value::as_array) {
        for chapter in chapters {
            let anchor = chapter.get("anchor").and_then(Value::as_str).unwrap_or("");
            body.push_str(&format!("<section id=\"{}\">\n", escape(anchor)));
            if let Some(blocks) = chapter.get("blocks").and_then(Value::as_array) {
                for block in blocks {
                    render_block(block, &mut body);
                }
            }
            body.push_str("</section>\n");
        }
    }

    format!(
        "<!DOCTYPE html>\n<html lang=\"zh\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{}</title>\n</head>\n<body>\n{}</body>\n</html>\n",
        escape(title),
        body
    )
}

fn render_block(block: &Value, out: &mut String) {
    let block_type = block.get("type").and_then(Value::as_str).unwrap_or_default();
    match block_type {
        "heading" => {
            let level = block.get("level").and_then(Value::as_i64).unwrap_or(2).clamp(1, 6);
            let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
            let anchor = block.get("anchor").and_then(Value::as_str).unwrap_or_default();
            out.push_str(&format!(
                "<h{level} id=\"{}\">{}</h{level}>\n",
                escape(anchor),
                escape(text)
            ));
        }
        "paragraph" => {
            out.push_str("<p>");
            render_inlines(block, out);
            out.push_str("</p>\n");
        }
        "list" => render_list(block, out),
        "table" => render_table(block, out),
        "swotTable" => render_quadrants(
            block,
            out,
            &[
                ("strengths", "优势"),
                ("weaknesses", "劣势"),
                ("opportunities", "机会"),
                ("threats", "威胁"),
            ],
        ),
        "pestTable" => render_quadrants(
            block,
            out,
            &[
                ("political", "政治"),
                ("economic", "经济"),
                ("social", "社会"),
                ("technological", "技术"),
            ],
        ),
        "blockquote" => {
            out.push_str("<blockquote>\n");
            render_child_blocks(block, out);
            out.push_str("</blockquote>\n");
        }
        "engineQuote" => {
            let title = block.get("title").and_then(Value::as_str).unwrap_or_default();
            out.push_str(&format!(
                "<blockquote class=\"engine-quote\"><cite>{}</cite>\n",
                escape(title)
            ));
            render_child_blocks(block, out);
            out.push_str("</blockquote>\n");
        }
        "callout" => {
            let tone = block.get("tone").and_then(Value::as_str).unwrap_or("info");
            out.push_str(&format!("<aside class=\"callout callout-{}\">\n", escape(tone)));
            render_child_blocks(block, out);
            out.push_str("</aside>\n");
        }
        "kpiGrid" => {
            out.push_str("<dl class=\"kpi-grid\">\n");
            if let Some(items) = block.get("items").and_then(Value::as_array) {
                for item in items {
                    let label = item.get("label").and_then(Value::as_str).unwrap_or_default();
                    let value = match item.get("value") {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    out.push_str(&format!(
                        "<dt>{}</dt><dd>{}</dd>\n",
                        escape(label),
                        escape(&value)
                    ));
                }
            }
            out.push_str("</dl>\n");
        }
        "code" => {
            let content = block.get("content").and_then(Value::as_str).unwrap_or_default();
            out.push_str(&format!("<pre><code>{}</code></pre>\n", escape(content)));
        }
        "math" => {
            let latex = block.get("latex").and_then(Value::as_str).unwrap_or_default();
            out.push_str(&format!("<div class=\"math\">{}</div>\n", escape(latex)));
        }
        "figure" => {
            let src = block.pointer("/img/src").and_then(Value::as_str).unwrap_or_default();
            let caption = block.get("caption").and_then(Value::as_str).unwrap_or_default();
            out.push_str(&format!(
                "<figure><img src=\"{}\" alt=\"{}\"><figcaption>{}</figcaption></figure>\n",
                escape(src),
                escape(caption),
                escape(caption)
            ));
        }
        "hr" => out.push_str("<hr>\n"),
        // toc and widget need renderer-side machinery this minimal
        // renderer does not carry.
        _ => {}
    }
}

fn render_child_blocks(block: &Value, out: &mut String) {
    if let Some(blocks) = block.get("blocks").and_then(Value::as_array) {
        for sub in blocks {
            render_block(sub, out);
        }
    }
}

fn render_list(block: &Value, out: &mut String) {
    let tag = match block.get("listType").and_then(Value::as_str) {
        Some("ordered") => "ol",
        _ => "ul",
    };
    out.push_str(&format!("<{tag}>\n"));
    if let Some(items) = block.get("items").and_then(Value::as_array) {
        for item in items {
            out.push_str("<li>");
            if let Some(item_blocks) = item.as_array() {
                for sub in item_blocks {
                    render_block(sub, out);
                }
            }
            out.push_str("</li>\n");
        }
    }
    out.push_str(&format!("</{tag}>\n"));
}

fn render_table(block: &Value, out: &mut String) {
    out.push_str("<table>\n");
    if let Some(rows) = block.get("rows").and_then(Value::as_array) {
        for row in rows {
            out.push_str("<tr>");
            if let Some(cells) = row.get("cells").and_then(Value::as_array) {
                for cell in cells {
                    out.push_str("<td>");
                    render_child_blocks(cell, out);
                    out.push_str("</td>");
                }
            }
            out.push_str("</tr>\n");
        }
    }
    out.push_str("</table>\n");
}

fn render_quadrants(block: &Value, out: &mut String, quadrants: &[(&str, &str)]) {
    out.push_str("<table class=\"quadrant\">\n");
    for (key, label) in quadrants {
        let Some(entries) = block.get(*key).and_then(Value::as_array) else {
            continue;
        };
        out.push_str(&format!("<tr><th>{}</th><td><ul>", escape(label)));
        for entry in entries {
            let text = match entry {
                Value::String(s) => s.clone(),
                Value::Object(obj) => ["title", "label", "text", "detail", "description"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_str))
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            };
            out.push_str(&format!("<li>{}</li>", escape(&text)));
        }
        out.push_str("</ul></td></tr>\n");
    }
    out.push_str("</table>\n");
}

fn render_inlines(block: &Value, out: &mut String) {
    let Some(inlines) = block.get("inlines").and_then(Value::as_array) else {
        return;
    };
    for run in inlines {
        let text = run.get("text").and_then(Value::as_str).unwrap_or_default();
        let marks: Vec<&str> = run
            .get("marks")
            .and_then(Value::as_array)
            .map(|marks| {
                marks
                    .iter()
                    .filter_map(|m| m.get("type").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();

        let mut open = String::new();
        let mut close = String::new();
        for mark in &marks {
            let tag = match *mark {
                "bold" => Some("strong"),
                "italic" => Some("em"),
                "underline" => Some("u"),
                "strike" => Some("s"),
                "code" => Some("code"),
                "subscript" => Some("sub"),
                "superscript" => Some("sup"),
                _ => None,
            };
            if let Some(tag) = tag {
                open.push_str(&format!("<{tag}>"));
                close = format!("</{tag}>{close}");
            }
        }
        out.push_str(&format!("{open}{}{close}", escape(text)));
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_renders_title_and_chapters() {
        let document = json!({
            "metadata": {"title": "市政热点报告", "subtitle": "阶段性研判"},
            "chapters": [{
                "anchor": "section-1-0",
                "blocks": [
                    {"type": "heading", "level": 2, "text": "1.0 综合分析", "anchor": "section-1-0"},
                    {"type": "paragraph", "inlines": [{"text": "正文", "marks": [{"type": "bold"}]}]},
                ],
            }],
        });
        let html = render_html(&document);
        assert!(html.contains("<h1>市政热点报告</h1>"));
        assert!(html.contains("<section id=\"section-1-0\">"));
        assert!(html.contains("<h2 id=\"section-1-0\">1.0 综合分析</h2>"));
        assert!(html.contains("<strong>正文</strong>"));
    }

    #[test]
    fn test_escapes_html() {
        let document = json!({
            "metadata": {"title": "<script>alert(1)</script>"},
            "chapters": [],
        });
        let html = render_html(&document);
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_list_and_table() {
        let document = json!({
            "metadata": {},
            "chapters": [{
                "anchor": "a",
                "blocks": [
                    {"type": "list", "listType": "ordered",
                     "items": [[{"type": "paragraph", "inlines": [{"text": "第一"}]}]]},
                    {"type": "table", "rows": [
                        {"cells": [{"blocks": [{"type": "paragraph", "inlines": [{"text": "单元格"}]}]}]},
                    ]},
                ],
            }],
        });
        let html = render_html(&document);
        assert!(html.contains("<ol>"));
        assert!(html.contains("<li><p>第一</p>"));
        assert!(html.contains("<td><p>单元格</p>"));
    }

    #[test]
    fn test_swot_quadrants() {
        let document = json!({
            "metadata": {},
            "chapters": [{
                "anchor": "a",
                "blocks": [
                    {"type": "swotTable",
                     "strengths": ["传播面广", {"title": "响应快", "impact": "高"}]},
                ],
            }],
        });
        let html = render_html(&document);
        assert!(html.contains("<th>优势</th>"));
        assert!(html.contains("<li>传播面广</li>"));
        assert!(html.contains("<li>响应快</li>"));
    }

    #[test]
    fn test_callout_and_engine_quote() {
        let document = json!({
            "metadata": {},
            "chapters": [{
                "anchor": "a",
                "blocks": [
                    {"type": "callout", "tone": "danger",
                     "blocks": [{"type": "paragraph", "inlines": [{"text": "风险提示"}]}]},
                    {"type": "engineQuote", "engine": "insight", "title": "Insight Agent",
                     "blocks": [{"type": "paragraph", "inlines": [{"text": "引用"}]}]},
                ],
            }],
        });
        let html = render_html(&document);
        assert!(html.contains("callout-danger"));
        assert!(html.contains("<cite>Insight Agent</cite>"));
    }
}
