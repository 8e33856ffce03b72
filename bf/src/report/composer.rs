//! Chapter stitching: merge validated chapter payloads into one Document IR.
//!
//! Injects missing chapter ids and anchors, keeps anchors globally unique,
//! and completes IR-level metadata for the renderers.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde_json::{Value, json};

use super::ir::IR_VERSION;

/// Stitches chapters into a Document IR. Tracks anchors already handed out
/// so duplicates get numeric suffixes.
#[derive(Debug, Default)]
pub struct DocumentComposer {
    seen_anchors: HashSet<String>,
}

impl DocumentComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort the chapters, assign ids/anchors, and emit the full IR.
    ///
    /// Anchor precedence per chapter: the toc custom entry configured in
    /// the metadata, then the chapter's own anchor, then `section-{idx}`.
    pub fn build_document(
        &mut self,
        report_id: &str,
        metadata: &Value,
        chapters: Vec<Value>,
    ) -> Value {
        let toc_anchor_map = build_toc_anchor_map(metadata);

        let mut ordered = chapters;
        ordered.sort_by_key(|c| c.get("order").and_then(Value::as_i64).unwrap_or(0));

        for (idx, chapter) in ordered.iter_mut().enumerate() {
            let idx = idx + 1;
            let Some(obj) = chapter.as_object_mut() else {
                continue;
            };

            if !obj.contains_key("chapterId") {
                obj.insert("chapterId".to_string(), json!(format!("S{idx}")));
            }
            let chapter_id = obj
                .get("chapterId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let anchor = toc_anchor_map
                .get(&chapter_id)
                .cloned()
                .or_else(|| {
                    obj.get("anchor")
                        .and_then(Value::as_str)
                        .filter(|a| !a.is_empty())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("section-{idx}"));
            let anchor = self.ensure_unique_anchor(&anchor);
            obj.insert("anchor".to_string(), json!(anchor));

            if !obj.contains_key("order") {
                obj.insert("order".to_string(), json!((idx as i64) * 10));
            }

            if obj.get("errorPlaceholder").and_then(Value::as_bool) == Some(true) {
                ensure_heading_block(obj);
            }
        }

        let mut document_metadata = metadata.clone();
        if let Some(meta_obj) = document_metadata.as_object_mut()
            && !meta_obj.contains_key("generatedAt")
        {
            meta_obj.insert(
                "generatedAt".to_string(),
                json!(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            );
        }

        json!({
            "version": IR_VERSION,
            "reportId": report_id,
            "metadata": document_metadata,
            "themeTokens": metadata.get("themeTokens").cloned().unwrap_or_else(|| json!({})),
            "chapters": ordered,
            "assets": metadata.get("assets").cloned().unwrap_or_else(|| json!({})),
        })
    }

    fn ensure_unique_anchor(&mut self, anchor: &str) -> String {
        let mut candidate = anchor.to_string();
        let mut counter = 2;
        while self.seen_anchors.contains(&candidate) {
            candidate = format!("{anchor}-{counter}");
            counter += 1;
        }
        self.seen_anchors.insert(candidate.clone());
        candidate
    }
}

/// chapterId -> anchor mapping from `metadata.toc.customEntries`.
fn build_toc_anchor_map(metadata: &Value) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let entries = metadata
        .get("toc")
        .and_then(|t| t.get("customEntries"))
        .and_then(Value::as_array);
    if let Some(entries) = entries {
        for entry in entries {
            if let (Some(chapter_id), Some(anchor)) = (
                entry.get("chapterId").and_then(Value::as_str),
                entry.get("anchor").and_then(Value::as_str),
            ) {
                map.insert(chapter_id.to_string(), anchor.to_string());
            }
        }
    }
    map
}

/// Placeholder chapters still need a heading so the table of contents can
/// link to them.
fn ensure_heading_block(chapter: &mut serde_json::Map<String, Value>) {
    let heading = json!({
        "type": "heading",
        "level": 2,
        "text": chapter.get("title").cloned().unwrap_or_else(|| json!("Placeholder chapter")),
        "anchor": chapter.get("anchor").cloned().unwrap_or(Value::Null),
    });
    match chapter.get_mut("blocks").and_then(Value::as_array_mut) {
        Some(blocks) => {
            let has_heading = blocks
                .iter()
                .any(|b| b.get("type").and_then(Value::as_str) == Some("heading"));
            if !has_heading {
                blocks.insert(0, heading);
            }
        }
        None => {
            chapter.insert("blocks".to_string(), json!([heading]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(id: &str, anchor: Option<&str>, order: i64) -> Value {
        let mut value = json!({
            "chapterId": id,
            "title": format!("章节 {id}"),
            "order": order,
            "blocks": [{"type": "paragraph", "inlines": [{"text": "内容"}]}],
        });
        if let Some(anchor) = anchor {
            value["anchor"] = json!(anchor);
        }
        value
    }

    #[test]
    fn test_chapters_sorted_and_versioned() {
        let mut composer = DocumentComposer::new();
        let document = composer.build_document(
            "report-1",
            &json!({"title": "报告"}),
            vec![chapter("S2", None, 20), chapter("S1", None, 10)],
        );

        assert_eq!(document["version"], IR_VERSION);
        assert_eq!(document["reportId"], "report-1");
        let chapters = document["chapters"].as_array().unwrap();
        assert_eq!(chapters[0]["chapterId"], "S1");
        assert_eq!(chapters[1]["chapterId"], "S2");
    }

    #[test]
    fn test_missing_chapter_id_defaulted() {
        let mut composer = DocumentComposer::new();
        let document = composer.build_document(
            "r",
            &json!({}),
            vec![json!({"order": 10, "blocks": []})],
        );
        assert_eq!(document["chapters"][0]["chapterId"], "S1");
        assert_eq!(document["chapters"][0]["anchor"], "section-1");
    }

    #[test]
    fn test_anchor_precedence_toc_wins() {
        let metadata = json!({
            "toc": {"customEntries": [{"chapterId": "S1", "anchor": "custom-intro"}]}
        });
        let mut composer = DocumentComposer::new();
        let document = composer.build_document(
            "r",
            &metadata,
            vec![chapter("S1", Some("own-anchor"), 10), chapter("S2", Some("own-two"), 20)],
        );
        assert_eq!(document["chapters"][0]["anchor"], "custom-intro");
        assert_eq!(document["chapters"][1]["anchor"], "own-two");
    }

    #[test]
    fn test_duplicate_anchors_suffixed() {
        let mut composer = DocumentComposer::new();
        let document = composer.build_document(
            "r",
            &json!({}),
            vec![
                chapter("S1", Some("section-1-0"), 10),
                chapter("S2", Some("section-1-0"), 20),
                chapter("S3", Some("section-1-0"), 30),
            ],
        );
        let anchors: Vec<&str> = document["chapters"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["anchor"].as_str().unwrap())
            .collect();
        assert_eq!(anchors, vec!["section-1-0", "section-1-0-2", "section-1-0-3"]);
    }

    #[test]
    fn test_anchors_pairwise_distinct_and_order_nondecreasing() {
        let mut composer = DocumentComposer::new();
        let chapters: Vec<Value> = (0..6)
            .map(|i| chapter(&format!("S{i}"), Some("dup"), (6 - i) * 10))
            .collect();
        let document = composer.build_document("r", &json!({}), chapters);

        let chapters = document["chapters"].as_array().unwrap();
        let mut seen = HashSet::new();
        let mut last_order = i64::MIN;
        for chapter in chapters {
            assert!(seen.insert(chapter["anchor"].as_str().unwrap().to_string()));
            let order = chapter["order"].as_i64().unwrap();
            assert!(order >= last_order);
            last_order = order;
        }
    }

    #[test]
    fn test_error_placeholder_gets_heading() {
        let mut composer = DocumentComposer::new();
        let document = composer.build_document(
            "r",
            &json!({}),
            vec![json!({
                "chapterId": "S1",
                "title": "失败章节",
                "order": 10,
                "errorPlaceholder": true,
                "blocks": [{"type": "paragraph", "inlines": [{"text": "生成失败"}]}],
            })],
        );
        let blocks = document["chapters"][0]["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "heading");
        assert_eq!(blocks[0]["text"], "失败章节");
    }

    #[test]
    fn test_generated_at_injected_once() {
        let mut composer = DocumentComposer::new();
        let document = composer.build_document("r", &json!({}), vec![]);
        assert!(document["metadata"]["generatedAt"].is_string());

        let mut composer = DocumentComposer::new();
        let document = composer.build_document(
            "r",
            &json!({"generatedAt": "2025-01-01T00:00:00Z"}),
            vec![],
        );
        assert_eq!(document["metadata"]["generatedAt"], "2025-01-01T00:00:00Z");
    }

    #[test]
    fn test_theme_tokens_carried() {
        let mut composer = DocumentComposer::new();
        let metadata = json!({"themeTokens": {"accent": "#0a7"}});
        let document = composer.build_document("r", &metadata, vec![]);
        assert_eq!(document["themeTokens"]["accent"], "#0a7");
    }
}
