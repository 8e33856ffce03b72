//! Chapter-level structural validation.
//!
//! LLM-generated chapters are validated before they are persisted and
//! stitched; a structural collapse at render time is far harder to debug
//! than a path-annotated error list here. Content quality is out of scope,
//! only shape and the closed enum sets are checked.

use serde_json::Value;

use super::ir::{
    ALLOWED_BLOCK_TYPES, ALLOWED_CALLOUT_TONES, ALLOWED_IMPACT_VALUES, ALLOWED_INLINE_MARKS,
    ALLOWED_LIST_TYPES, ENGINE_AGENT_TITLES,
};

/// Chapter IR validator. Errors carry a JSON-path location such as
/// `blocks[3].inlines[1].marks[0].type`.
#[derive(Debug, Default)]
pub struct IrValidator;

impl IrValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate one chapter payload. Returns `(passed, errors)`.
    pub fn validate_chapter(&self, chapter: &Value) -> (bool, Vec<String>) {
        let mut errors = Vec::new();

        let Some(chapter_obj) = chapter.as_object() else {
            return (false, vec!["chapter must be an object".to_string()]);
        };

        for field in ["chapterId", "title", "anchor", "order", "blocks"] {
            if !chapter_obj.contains_key(field) {
                errors.push(format!("missing chapter.{field}"));
            }
        }

        let blocks = chapter_obj.get("blocks").and_then(Value::as_array);
        match blocks {
            Some(blocks) if !blocks.is_empty() => {
                for (idx, block) in blocks.iter().enumerate() {
                    self.validate_block(block, &format!("blocks[{idx}]"), &mut errors);
                }
            }
            _ => {
                errors.push("chapter.blocks must be a non-empty array".to_string());
                return (false, errors);
            }
        }

        (errors.is_empty(), errors)
    }

    fn validate_block(&self, block: &Value, path: &str, errors: &mut Vec<String>) {
        let Some(obj) = block.as_object() else {
            errors.push(format!("{path} must be an object"));
            return;
        };

        let block_type = obj.get("type").and_then(Value::as_str).unwrap_or_default();
        if !ALLOWED_BLOCK_TYPES.contains(&block_type) {
            errors.push(format!("{path}.type is not supported: {block_type:?}"));
            return;
        }

        match block_type {
            "heading" => self.validate_heading(obj, path, errors),
            "paragraph" => self.validate_paragraph(obj, path, errors),
            "list" => self.validate_list(obj, path, errors),
            "table" => self.validate_table(obj, path, errors),
            "swotTable" => self.validate_quadrant_table(
                obj,
                path,
                errors,
                &["strengths", "weaknesses", "opportunities", "threats"],
            ),
            "pestTable" => self.validate_quadrant_table(
                obj,
                path,
                errors,
                &["political", "economic", "social", "technological"],
            ),
            "blockquote" => self.validate_child_blocks(obj, path, errors),
            "engineQuote" => self.validate_engine_quote(obj, path, errors),
            "callout" => self.validate_callout(obj, path, errors),
            "kpiGrid" => self.validate_kpi_grid(obj, path, errors),
            "widget" => self.validate_widget(obj, path, errors),
            "code" => {
                if !obj.contains_key("content") {
                    errors.push(format!("{path}.content is missing"));
                }
            }
            "math" => {
                if !obj.contains_key("latex") {
                    errors.push(format!("{path}.latex is missing"));
                }
            }
            "figure" => self.validate_figure(obj, path, errors),
            // hr and toc carry no required payload
            _ => {}
        }
    }

    fn validate_heading(
        &self,
        block: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        if !block.get("level").is_some_and(Value::is_i64) {
            errors.push(format!("{path}.level must be an integer"));
        }
        if !block.contains_key("text") {
            errors.push(format!("{path}.text is missing"));
        }
        if !block.contains_key("anchor") {
            errors.push(format!("{path}.anchor is missing"));
        }
    }

    fn validate_paragraph(
        &self,
        block: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let Some(inlines) = block.get("inlines").and_then(Value::as_array).filter(|a| !a.is_empty())
        else {
            errors.push(format!("{path}.inlines must be a non-empty array"));
            return;
        };
        for (idx, run) in inlines.iter().enumerate() {
            self.validate_inline_run(run, &format!("{path}.inlines[{idx}]"), errors, None);
        }
    }

    fn validate_list(
        &self,
        block: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let list_type = block.get("listType").and_then(Value::as_str).unwrap_or_default();
        if !ALLOWED_LIST_TYPES.contains(&list_type) {
            errors.push(format!("{path}.listType value is illegal: {list_type:?}"));
        }
        let Some(items) = block.get("items").and_then(Value::as_array).filter(|a| !a.is_empty())
        else {
            errors.push(format!("{path}.items must be a non-empty array"));
            return;
        };
        for (i, item) in items.iter().enumerate() {
            let Some(item_blocks) = item.as_array() else {
                errors.push(format!("{path}.items[{i}] must be an array of blocks"));
                continue;
            };
            for (j, sub) in item_blocks.iter().enumerate() {
                self.validate_block(sub, &format!("{path}.items[{i}][{j}]"), errors);
            }
        }
    }

    fn validate_table(
        &self,
        block: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let Some(rows) = block.get("rows").and_then(Value::as_array).filter(|a| !a.is_empty())
        else {
            errors.push(format!("{path}.rows must be a non-empty array"));
            return;
        };
        for (r, row) in rows.iter().enumerate() {
            let cells = row.get("cells").and_then(Value::as_array);
            let Some(cells) = cells.filter(|c| !c.is_empty()) else {
                errors.push(format!("{path}.rows[{r}].cells must be a non-empty array"));
                continue;
            };
            for (c, cell) in cells.iter().enumerate() {
                let Some(cell_obj) = cell.as_object() else {
                    errors.push(format!("{path}.rows[{r}].cells[{c}] must be an object"));
                    continue;
                };
                let blocks = cell_obj.get("blocks").and_then(Value::as_array);
                let Some(blocks) = blocks.filter(|b| !b.is_empty()) else {
                    errors.push(format!(
                        "{path}.rows[{r}].cells[{c}].blocks must be a non-empty array"
                    ));
                    continue;
                };
                for (b, sub) in blocks.iter().enumerate() {
                    self.validate_block(sub, &format!("{path}.rows[{r}].cells[{c}].blocks[{b}]"), errors);
                }
            }
        }
    }

    /// SWOT and PEST share the shape: at least one quadrant, each an array
    /// of string or object entries.
    fn validate_quadrant_table(
        &self,
        block: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
        quadrants: &[&str],
    ) {
        if !quadrants.iter().any(|q| block.get(*q).is_some()) {
            errors.push(format!("{path} needs at least one of {}", quadrants.join("/")));
        }
        for quadrant in quadrants {
            let Some(entries) = block.get(*quadrant) else {
                continue;
            };
            let Some(entries) = entries.as_array() else {
                errors.push(format!("{path}.{quadrant} must be an array"));
                continue;
            };
            for (idx, entry) in entries.iter().enumerate() {
                self.validate_quadrant_item(entry, &format!("{path}.{quadrant}[{idx}]"), errors);
            }
        }
    }

    fn validate_quadrant_item(&self, item: &Value, path: &str, errors: &mut Vec<String>) {
        if let Some(text) = item.as_str() {
            if text.trim().is_empty() {
                errors.push(format!("{path} cannot be an empty string"));
            }
            return;
        }
        let Some(obj) = item.as_object() else {
            errors.push(format!("{path} must be a string or object"));
            return;
        };

        let has_text = ["title", "label", "text", "detail", "description"]
            .iter()
            .any(|key| obj.get(*key).and_then(Value::as_str).is_some_and(|s| !s.trim().is_empty()));
        if !has_text {
            errors.push(format!("{path} is missing a text field (title/label/text/description)"));
        }

        if let Some(impact) = obj.get("impact") {
            let valid = impact
                .as_str()
                .is_some_and(|s| ALLOWED_IMPACT_VALUES.contains(&s));
            if !valid {
                errors.push(format!(
                    "{path}.impact only allows a rating of {}, got: {impact}",
                    ALLOWED_IMPACT_VALUES.join("/")
                ));
            }
        }
    }

    fn validate_child_blocks(
        &self,
        block: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let Some(inner) = block.get("blocks").and_then(Value::as_array).filter(|a| !a.is_empty())
        else {
            errors.push(format!("{path}.blocks must be a non-empty array"));
            return;
        };
        for (idx, sub) in inner.iter().enumerate() {
            self.validate_block(sub, &format!("{path}.blocks[{idx}]"), errors);
        }
    }

    /// Engine quotes are restricted: a known engine, the matching agent
    /// title, and paragraph children carrying only bold/italic marks.
    fn validate_engine_quote(
        &self,
        block: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let engine_raw = block.get("engine").and_then(Value::as_str);
        let engine = engine_raw.map(|s| s.to_ascii_lowercase());
        let expected_title = engine
            .as_deref()
            .and_then(|e| ENGINE_AGENT_TITLES.get(e).copied());

        if expected_title.is_none() {
            errors.push(format!("{path}.engine illegal value: {engine_raw:?}"));
        }

        match block.get("title") {
            None => errors.push(format!("{path}.title is missing")),
            Some(Value::String(title)) => {
                if let Some(expected) = expected_title
                    && title != expected
                {
                    errors.push(format!(
                        "{path}.title must match the engine's agent name: {expected}"
                    ));
                }
            }
            Some(_) => errors.push(format!("{path}.title must be a string")),
        }

        let Some(inner) = block.get("blocks").and_then(Value::as_array).filter(|a| !a.is_empty())
        else {
            errors.push(format!("{path}.blocks must be a non-empty array"));
            return;
        };
        for (idx, sub) in inner.iter().enumerate() {
            let sub_path = format!("{path}.blocks[{idx}]");
            let Some(sub_obj) = sub.as_object() else {
                errors.push(format!("{sub_path} must be an object"));
                continue;
            };
            if sub_obj.get("type").and_then(Value::as_str) != Some("paragraph") {
                errors.push(format!("{sub_path}.type only allows paragraph"));
                continue;
            }
            let Some(inlines) =
                sub_obj.get("inlines").and_then(Value::as_array).filter(|a| !a.is_empty())
            else {
                errors.push(format!("{sub_path}.inlines must be a non-empty array"));
                continue;
            };
            for (ridx, run) in inlines.iter().enumerate() {
                self.validate_inline_run(
                    run,
                    &format!("{sub_path}.inlines[{ridx}]"),
                    errors,
                    Some(&["bold", "italic"]),
                );
            }
        }
    }

    fn validate_callout(
        &self,
        block: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let tone = block.get("tone").and_then(Value::as_str).unwrap_or_default();
        if !ALLOWED_CALLOUT_TONES.contains(&tone) {
            errors.push(format!("{path}.tone illegal value: {tone:?}"));
        }
        self.validate_child_blocks(block, path, errors);
    }

    fn validate_kpi_grid(
        &self,
        block: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let Some(items) = block.get("items").and_then(Value::as_array).filter(|a| !a.is_empty())
        else {
            errors.push(format!("{path}.items must be a non-empty array"));
            return;
        };
        for (idx, item) in items.iter().enumerate() {
            let Some(obj) = item.as_object() else {
                errors.push(format!("{path}.items[{idx}] must be an object"));
                continue;
            };
            if !obj.contains_key("label") || !obj.contains_key("value") {
                errors.push(format!("{path}.items[{idx}] requires label and value"));
            }
        }
    }

    fn validate_widget(
        &self,
        block: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        if !block.contains_key("widgetId") {
            errors.push(format!("{path}.widgetId is missing"));
        }
        if !block.contains_key("widgetType") {
            errors.push(format!("{path}.widgetType is missing"));
        }
        if !block.contains_key("data") && !block.contains_key("dataRef") {
            errors.push(format!("{path} requires either data or dataRef"));
        }
    }

    fn validate_figure(
        &self,
        block: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let Some(img) = block.get("img").and_then(Value::as_object) else {
            errors.push(format!("{path}.img must be an object"));
            return;
        };
        if !img.contains_key("src") {
            errors.push(format!("{path}.img.src is missing"));
        }
    }

    fn validate_inline_run(
        &self,
        run: &Value,
        path: &str,
        errors: &mut Vec<String>,
        allowed_marks: Option<&[&str]>,
    ) {
        let Some(obj) = run.as_object() else {
            errors.push(format!("{path} must be an object"));
            return;
        };
        if !obj.contains_key("text") {
            errors.push(format!("{path}.text is missing"));
        }
        let Some(marks) = obj.get("marks") else {
            return;
        };
        if marks.is_null() {
            return;
        }
        let Some(marks) = marks.as_array() else {
            errors.push(format!("{path}.marks must be an array"));
            return;
        };
        for (midx, mark) in marks.iter().enumerate() {
            let Some(mark_obj) = mark.as_object() else {
                errors.push(format!("{path}.marks[{midx}] must be an object"));
                continue;
            };
            let mark_type = mark_obj.get("type").and_then(Value::as_str).unwrap_or_default();
            let allowed = allowed_marks.unwrap_or(ALLOWED_INLINE_MARKS);
            if !allowed.contains(&mark_type) {
                errors.push(format!("{path}.marks[{midx}].type is not supported: {mark_type:?}"));
            }
        }
    }
}
