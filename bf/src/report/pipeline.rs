//! Staged report generation.
//!
//! The pipeline turns `(query, three engine reports, forum log)` into a
//! validated Document IR: template selection, template slicing, document
//! layout, word budget, then one streamed LLM call per chapter with a
//! layered recovery ladder (retry, sparse fallback, cross-engine rescue),
//! finally stitching and rendering.
//!
//! Control flow for recovery is driven by tagged error variants rather
//! than exceptions; the ladder pattern-matches on the error kind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use reportstore::{ChapterMeta, ChapterStore, write_quarantine};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::events::EventKind;
use crate::jsonrepair::RobustJsonParser;
use crate::llm::{CompletionRequest, LlmClient, Message, StreamChunk};

use super::composer::DocumentComposer;
use super::prompts::{
    FALLBACK_TEMPLATE, FALLBACK_TEMPLATE_NAME, PromptLibrary, SYSTEM_CHAPTER_GENERATION,
    SYSTEM_DOCUMENT_LAYOUT, SYSTEM_PROMPT_CHAPTER_JSON_RECOVERY, SYSTEM_TEMPLATE_SELECTION,
    SYSTEM_WORD_BUDGET,
};
use super::renderer::render_html;
use super::template::{TemplateSection, parse_template_sections};
use super::validator::IrValidator;

/// Sparse chapters always get at least this many attempts.
const CONTENT_SPARSE_MIN_ATTEMPTS: u32 = 3;

/// Minimum body characters before a chapter counts as sparse.
const CHAPTER_MIN_BODY_CHARS: usize = 150;

/// Warning paragraph prepended to an accepted sparse chapter.
const CONTENT_SPARSE_WARNING_TEXT: &str =
    "本章节由LLM生成的内容字数可能过低，已保留最完整的一次生成结果，请结合原始数据谨慎参考。";

/// Provider messages that indicate a content-safety rejection. These are
/// transient from the pipeline's point of view and retried regardless of
/// error type.
const CONTENT_SAFETY_KEYWORDS: &[&str] = &[
    "inappropriate content",
    "content violation",
    "content moderation",
    "model-studio/error-code",
];

const STAGE_MAX_TOKENS: u32 = 4096;
const CHAPTER_MAX_TOKENS: u32 = 8192;

/// Why a chapter ultimately failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterErrorKind {
    ParseFail,
    Sparse,
    Validation,
    ContentModeration,
    Transport,
}

/// Pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{stage} returned a malformed result: {message}")]
    StageOutputFormat { stage: String, message: String },

    #[error("chapter {chapter} failed ({kind:?}) after {attempts} attempts: {message}")]
    ChapterFailed {
        chapter: String,
        kind: ChapterErrorKind,
        attempts: u32,
        message: String,
    },

    #[error("template produced no sections")]
    EmptyTemplate,

    #[error("report generation cancelled")]
    Cancelled,

    #[error(transparent)]
    Llm(#[from] crate::llm::LlmError),

    #[error(transparent)]
    Store(#[from] reportstore::StoreError),
}

/// Raw engine report as handed to the pipeline boundary
#[derive(Debug, Clone)]
pub enum EngineReportInput {
    Text(String),
    Structured(Value),
}

impl EngineReportInput {
    fn stringify(&self) -> String {
        match self {
            EngineReportInput::Text(text) => text.clone(),
            EngineReportInput::Structured(value) => {
                serde_json::to_string_pretty(value).unwrap_or_default()
            }
        }
    }
}

/// Inline stream handler; must never take the pipeline down.
pub type StreamHandler = Arc<dyn Fn(EventKind, Value) + Send + Sync>;

/// One report generation request
#[derive(Clone)]
pub struct ReportRequest {
    pub report_id: Option<String>,
    pub query: String,
    /// Fixed order: query, media, insight
    pub reports: Vec<EngineReportInput>,
    pub forum_logs: String,
    pub custom_template: String,
    pub save_report: bool,
    /// Checked at stage boundaries and between chapter attempts.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl ReportRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            report_id: None,
            query: query.into(),
            reports: Vec::new(),
            forum_logs: String::new(),
            custom_template: String::new(),
            save_report: true,
            cancel: None,
        }
    }
}

/// Result paths and artifacts of a finished run
#[derive(Debug, Clone)]
pub struct ReportResult {
    pub report_id: String,
    pub run_dir: PathBuf,
    pub document_ir: Value,
    pub html: String,
    pub html_path: Option<PathBuf>,
    pub ir_path: Option<PathBuf>,
}

/// Filesystem and tuning knobs for the pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub template_dir: PathBuf,
    pub json_error_log_dir: PathBuf,
    pub final_reports_dir: PathBuf,
    pub ir_dir: PathBuf,
    pub chapter_json_max_attempts: u32,
    pub structural_retry_attempts: u32,
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            template_dir: settings.template_dir.clone(),
            json_error_log_dir: settings.json_error_log_dir.clone(),
            final_reports_dir: settings.final_reports_dir.clone(),
            ir_dir: settings.ir_dir(),
            chapter_json_max_attempts: settings.chapter_json_max_attempts,
            structural_retry_attempts: settings.structural_retry_attempts,
        }
    }
}

/// Per-attempt outcome used internally by the recovery ladder
enum AttemptError {
    Parse { message: String, raw: String },
    Sparse { payload: Value, body_chars: usize },
    Validation { errors: Vec<String>, payload: Value, raw: String },
    Llm(crate::llm::LlmError),
}

/// The staged report pipeline
pub struct ReportPipeline {
    llm: Arc<dyn LlmClient>,
    rescue_clients: Vec<(String, Arc<dyn LlmClient>)>,
    storage: Arc<ChapterStore>,
    prompts: PromptLibrary,
    parser: RobustJsonParser,
    validator: IrValidator,
    config: PipelineConfig,
}

impl ReportPipeline {
    pub fn new(llm: Arc<dyn LlmClient>, storage: Arc<ChapterStore>, config: PipelineConfig) -> Self {
        Self {
            llm,
            rescue_clients: Vec::new(),
            storage,
            prompts: PromptLibrary::new(),
            parser: RobustJsonParser::new(),
            validator: IrValidator::new(),
            config,
        }
    }

    /// Ordered fallback clients for the JSON-recovery path, usually drawn
    /// from the other engines' credentials.
    pub fn with_rescue_clients(mut self, clients: Vec<(String, Arc<dyn LlmClient>)>) -> Self {
        self.rescue_clients = clients;
        self
    }

    /// Enable the parser's LLM-assisted repair stage, backed by `client`.
    /// Requires the multi-thread runtime (the hook blocks in place).
    pub fn with_llm_repair(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.parser = RobustJsonParser::new().with_llm_repair(llm_repair_hook(client));
        self
    }

    /// Run the full pipeline. Stream events flow through `stream` inline;
    /// failures inside the handler are swallowed.
    pub async fn generate_report(
        &self,
        request: ReportRequest,
        stream: Option<StreamHandler>,
    ) -> Result<ReportResult, PipelineError> {
        let result = self.generate_inner(&request, &stream).await;
        if let Err(e) = &result {
            emit(&stream, EventKind::Error, json!({"stage": "agent_failed", "message": e.to_string()}));
        }
        result
    }

    async fn generate_inner(
        &self,
        request: &ReportRequest,
        stream: &Option<StreamHandler>,
    ) -> Result<ReportResult, PipelineError> {
        let started = Instant::now();
        let report_id = request
            .report_id
            .clone()
            .unwrap_or_else(|| format!("report-{}", &Uuid::new_v4().simple().to_string()[..8]));
        info!(%report_id, query = %request.query, "report generation started");
        emit(
            stream,
            EventKind::AgentStart,
            json!({"report_id": report_id, "query": request.query}),
        );

        let normalized_reports = normalize_reports(&request.reports);

        // Stage 1: template selection
        self.check_cancel(request)?;
        let template = self.select_template(request, &normalized_reports).await;
        emit(
            stream,
            EventKind::TemplateSelected,
            json!({"template": template.name, "reason": template.reason}),
        );
        emit(stream, EventKind::Progress, json!({"progress": 10, "message": "模板选择完成"}));

        // Stage 2: slicing
        let mut sections = parse_template_sections(&template.content);
        let template_content = if sections.is_empty() {
            warn!("template produced no sections, using built-in fallback");
            sections = parse_template_sections(FALLBACK_TEMPLATE);
            FALLBACK_TEMPLATE.to_string()
        } else {
            template.content.clone()
        };
        if sections.is_empty() {
            return Err(PipelineError::EmptyTemplate);
        }
        emit(stream, EventKind::TemplateSliced, json!({"section_count": sections.len()}));

        let template_overview = build_template_overview(&template_content, &sections);

        // Stage 3: document layout
        self.check_cancel(request)?;
        let layout = self
            .run_stage("document layout", |attempt| {
                self.layout_stage(
                    request,
                    &normalized_reports,
                    &template_content,
                    &sections,
                    &template_overview,
                    attempt,
                )
            })
            .await?;
        emit(
            stream,
            EventKind::LayoutDesigned,
            json!({"title": layout.get("title"), "toc": layout.get("tocTitle")}),
        );
        emit(stream, EventKind::Progress, json!({"progress": 15, "message": "文档标题/目录设计完成"}));

        // Stage 4: word budget
        self.check_cancel(request)?;
        let word_plan = self
            .run_stage("word budget", |attempt| {
                self.word_budget_stage(
                    request,
                    &layout,
                    &sections,
                    &template_overview,
                    attempt,
                )
            })
            .await?;
        emit(
            stream,
            EventKind::WordPlanReady,
            json!({"chapter_targets": word_plan["chapters"].as_array().map(Vec::len).unwrap_or(0)}),
        );
        emit(stream, EventKind::Progress, json!({"progress": 20, "message": "章节字数规划已生成"}));

        // Session storage + planning artifacts
        let manifest_meta = build_manifest_meta(request, &template, &layout, &word_plan, &template_overview);
        let run_dir = self.storage.start_session(&report_id, manifest_meta.clone())?;
        self.persist_planning_artifacts(&run_dir, &layout, &word_plan, &template_overview);
        emit(stream, EventKind::StorageReady, json!({"run_dir": run_dir.display().to_string()}));

        // Stage 5: chapters, strictly sequential
        let total_chapters = sections.len();
        let mut chapters: Vec<Value> = Vec::with_capacity(total_chapters);
        for (done, section) in sections.iter().enumerate() {
            self.check_cancel(request)?;
            let payload = self
                .generate_chapter(
                    request,
                    &report_id,
                    &run_dir,
                    section,
                    &normalized_reports,
                    &layout,
                    &word_plan,
                    stream,
                )
                .await?;
            chapters.push(payload);

            let progress = 20 + (80 * (done + 1) / total_chapters) as u64;
            emit(
                stream,
                EventKind::Progress,
                json!({"progress": progress, "message": format!("章节 {}/{} 已完成", done + 1, total_chapters)}),
            );
        }

        // Stage 6: stitch
        let mut composer = DocumentComposer::new();
        let document_ir = composer.build_document(&report_id, &manifest_meta, chapters);
        emit(
            stream,
            EventKind::ChaptersCompiled,
            json!({"chapter_count": document_ir["chapters"].as_array().map(Vec::len).unwrap_or(0)}),
        );

        // Stage 7: render
        let html = render_html(&document_ir);
        emit(stream, EventKind::HtmlRendered, json!({"html_length": html.len()}));

        let mut html_path = None;
        let mut ir_path = None;
        if request.save_report {
            let (saved_html, saved_ir) = self.save_outputs(&report_id, &html, &document_ir)?;
            emit(
                stream,
                EventKind::ReportSaved,
                json!({
                    "html": saved_html.display().to_string(),
                    "ir": saved_ir.display().to_string(),
                }),
            );
            html_path = Some(saved_html);
            ir_path = Some(saved_ir);
        }

        let seconds = started.elapsed().as_secs_f64();
        info!(%report_id, seconds, "report generation completed");
        emit(stream, EventKind::Metrics, json!({"generation_seconds": seconds}));

        Ok(ReportResult {
            report_id,
            run_dir,
            document_ir,
            html,
            html_path,
            ir_path,
        })
    }

    fn check_cancel(&self, request: &ReportRequest) -> Result<(), PipelineError> {
        match &request.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(PipelineError::Cancelled),
            _ => Ok(()),
        }
    }

    // ======== stages ========

    /// Stage-level retry: only `StageOutputFormat` is retried, up to the
    /// configured attempt count, with the same prompt.
    async fn run_stage<'a, F, Fut>(&'a self, stage: &str, f: F) -> Result<Value, PipelineError>
    where
        F: Fn(u32) -> Fut,
        Fut: std::future::Future<Output = Result<Value, PipelineError>> + 'a,
    {
        let attempts = self.config.structural_retry_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e @ PipelineError::StageOutputFormat { .. }) => {
                    warn!(stage, attempt, error = %e, "stage output malformed, retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.expect("at least one attempt ran"))
    }

    async fn complete_stage(
        &self,
        system_prompt: &str,
        user_prompt: String,
        context: &str,
        expected_keys: &[&str],
    ) -> Result<Value, PipelineError> {
        let response = self
            .llm
            .complete(CompletionRequest {
                system_prompt: system_prompt.to_string(),
                messages: vec![Message::user(user_prompt)],
                max_tokens: STAGE_MAX_TOKENS,
            })
            .await?;
        let parsed = self
            .parser
            .parse(response.text(), context, expected_keys, None)
            .map_err(|e| PipelineError::StageOutputFormat {
                stage: context.to_string(),
                message: e.message,
            })?;
        ensure_mapping(parsed, context)
    }

    async fn select_template(&self, request: &ReportRequest, reports: &Value) -> SelectedTemplate {
        if !request.custom_template.trim().is_empty() {
            return SelectedTemplate {
                name: "自定义模板".to_string(),
                content: request.custom_template.clone(),
                reason: "用户指定模板".to_string(),
            };
        }

        let candidates = list_templates(&self.config.template_dir);
        if candidates.is_empty() {
            debug!("template directory empty, using built-in fallback");
            return SelectedTemplate::fallback();
        }

        let data = json!({
            "query": request.query,
            "templates": candidates.iter().map(|(name, _)| json!({"name": name})).collect::<Vec<_>>(),
            "custom_template": "",
            "reports": reports,
            "forum_logs": request.forum_logs,
        });
        let user_prompt = match self.prompts.render("template_selection", &data) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "template selection prompt failed, using fallback");
                return SelectedTemplate::fallback();
            }
        };

        let result = self
            .complete_stage(
                SYSTEM_TEMPLATE_SELECTION,
                user_prompt,
                "template selection",
                &["template_name", "template_content", "selection_reason"],
            )
            .await;

        match result {
            Ok(value) => {
                let name = value
                    .get("template_name")
                    .and_then(Value::as_str)
                    .unwrap_or(FALLBACK_TEMPLATE_NAME)
                    .to_string();
                // Prefer the on-disk content for a known template name so a
                // hallucinated body cannot replace the real file.
                let content = candidates
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, c)| c.clone())
                    .or_else(|| {
                        value
                            .get("template_content")
                            .and_then(Value::as_str)
                            .filter(|c| !c.trim().is_empty())
                            .map(str::to_string)
                    });
                match content {
                    Some(content) => SelectedTemplate {
                        name,
                        content,
                        reason: value
                            .get("selection_reason")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    },
                    None => SelectedTemplate::fallback(),
                }
            }
            Err(e) => {
                warn!(error = %e, "template selection failed, using fallback");
                SelectedTemplate::fallback()
            }
        }
    }

    async fn layout_stage(
        &self,
        request: &ReportRequest,
        reports: &Value,
        template_content: &str,
        sections: &[TemplateSection],
        template_overview: &Value,
        attempt: u32,
    ) -> Result<Value, PipelineError> {
        debug!(attempt, "layout_stage");
        let data = json!({
            "query": request.query,
            "template_overview": template_overview.to_string(),
            "template_content": template_content,
            "sections": serde_json::to_string(sections).unwrap_or_default(),
            "reports": reports,
            "forum_logs": request.forum_logs,
        });
        let user_prompt = self.prompts.render("document_layout", &data).map_err(|e| {
            PipelineError::StageOutputFormat {
                stage: "document layout".to_string(),
                message: e.to_string(),
            }
        })?;
        let mut layout = self
            .complete_stage(
                SYSTEM_DOCUMENT_LAYOUT,
                user_prompt,
                "document layout",
                &["title", "hero", "tocPlan", "tocTitle"],
            )
            .await?;
        enforce_swot_pest_limits(&mut layout);
        Ok(layout)
    }

    async fn word_budget_stage(
        &self,
        request: &ReportRequest,
        layout: &Value,
        sections: &[TemplateSection],
        template_overview: &Value,
        attempt: u32,
    ) -> Result<Value, PipelineError> {
        debug!(attempt, "word_budget_stage");
        let data = json!({
            "query": request.query,
            "layout": layout.to_string(),
            "sections": serde_json::to_string(sections).unwrap_or_default(),
            "template_overview": template_overview.to_string(),
        });
        let user_prompt = self.prompts.render("word_budget", &data).map_err(|e| {
            PipelineError::StageOutputFormat {
                stage: "word budget".to_string(),
                message: e.to_string(),
            }
        })?;
        let plan = self
            .complete_stage(
                SYSTEM_WORD_BUDGET,
                user_prompt,
                "word budget",
                &["chapters", "totalWords", "globalGuidelines"],
            )
            .await?;
        normalize_word_plan(plan, "word budget")
    }

    // ======== chapter ladder ========

    #[allow(clippy::too_many_arguments)]
    async fn generate_chapter(
        &self,
        request: &ReportRequest,
        report_id: &str,
        run_dir: &Path,
        section: &TemplateSection,
        reports: &Value,
        layout: &Value,
        word_plan: &Value,
        stream: &Option<StreamHandler>,
    ) -> Result<Value, PipelineError> {
        info!(chapter = %section.title, "generating chapter");
        emit(
            stream,
            EventKind::ChapterStatus,
            json!({"chapterId": section.chapter_id, "title": section.title, "status": "running"}),
        );

        let meta = ChapterMeta {
            chapter_id: section.chapter_id.clone(),
            slug: section.slug.clone(),
            title: section.title.clone(),
            order: section.order,
        };
        let chapter_dir = self.storage.begin_chapter(run_dir, &meta)?;

        let directive = chapter_directive(word_plan, &section.chapter_id);
        let (allow_swot, allow_pest) = chapter_permissions(layout, &section.chapter_id);
        let prompt_data = json!({
            "query": request.query,
            "section": serde_json::to_string(section).unwrap_or_default(),
            "directive": directive.to_string(),
            "theme_tokens": layout.get("themeTokens").cloned().unwrap_or_else(|| json!({})).to_string(),
            "reports": reports,
            "forum_logs": request.forum_logs,
            "allow_swot": allow_swot,
            "allow_pest": allow_pest,
        });
        let user_prompt =
            self.prompts
                .render("chapter_generation", &prompt_data)
                .map_err(|e| PipelineError::StageOutputFormat {
                    stage: format!("chapter {}", section.chapter_id),
                    message: e.to_string(),
                })?;

        let max_attempts = self.config.chapter_json_max_attempts.max(CONTENT_SPARSE_MIN_ATTEMPTS);
        let mut best_sparse: Option<(Value, usize)> = None;
        let mut fallback_used = false;
        let mut last_raw = String::new();
        let mut payload: Option<Value> = None;
        let mut attempts_used = 0;

        for attempt in 1..=max_attempts {
            attempts_used = attempt;
            self.check_cancel(request)?;

            let outcome = self
                .chapter_attempt(section, &user_prompt, &chapter_dir, stream)
                .await;
            match outcome {
                Ok(chapter) => {
                    payload = Some(chapter);
                    break;
                }
                Err(AttemptError::Llm(e)) if is_content_safety_message(&e.to_string()) => {
                    warn!(chapter = %section.title, attempt, error = %e, "content safety rejection, retrying");
                    emit_chapter_retry(stream, section, attempt, max_attempts, "content_filter", &e.to_string(), None);
                    if attempt >= max_attempts {
                        return Err(PipelineError::ChapterFailed {
                            chapter: section.chapter_id.clone(),
                            kind: ChapterErrorKind::ContentModeration,
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                }
                Err(AttemptError::Llm(e)) => {
                    // Transport-level failures were already retried inside
                    // the client; surface them.
                    return Err(PipelineError::Llm(e));
                }
                Err(AttemptError::Sparse { payload: candidate, body_chars }) => {
                    warn!(chapter = %section.title, attempt, body_chars, "chapter content sparse");
                    let is_best =
                        best_sparse.as_ref().is_none_or(|(_, best)| body_chars > *best);
                    if is_best {
                        best_sparse = Some((candidate, body_chars));
                    }
                    let will_fallback = attempt >= max_attempts
                        && attempt >= CONTENT_SPARSE_MIN_ATTEMPTS
                        && best_sparse.is_some();
                    emit_chapter_retry(
                        stream,
                        section,
                        attempt,
                        max_attempts,
                        "content_sparse",
                        "body character count below threshold",
                        will_fallback.then_some("content_sparse_fallback_pending"),
                    );
                    if will_fallback {
                        let (best, chars) = best_sparse.take().expect("sparse candidate exists");
                        warn!(chapter = %section.title, chars, "accepting densest sparse candidate");
                        payload = Some(finalize_sparse_chapter(best));
                        fallback_used = true;
                        break;
                    }
                    if attempt >= max_attempts {
                        return Err(PipelineError::ChapterFailed {
                            chapter: section.chapter_id.clone(),
                            kind: ChapterErrorKind::Sparse,
                            attempts: attempt,
                            message: "no usable sparse candidate".to_string(),
                        });
                    }
                }
                Err(AttemptError::Parse { message, raw }) => {
                    warn!(chapter = %section.title, attempt, "chapter JSON unparseable");
                    last_raw = raw;
                    emit_chapter_retry(stream, section, attempt, max_attempts, "json_parse", &message, None);
                    if attempt >= max_attempts {
                        return self
                            .last_resort(request, report_id, run_dir, section, &meta, &last_raw, ChapterErrorKind::ParseFail, attempt, &message, None, stream)
                            .await;
                    }
                }
                Err(AttemptError::Validation { errors, payload: invalid, raw }) => {
                    warn!(chapter = %section.title, attempt, error_count = errors.len(), "chapter failed validation");
                    last_raw = raw;
                    emit_chapter_retry(
                        stream,
                        section,
                        attempt,
                        max_attempts,
                        "validation",
                        &errors.join("; "),
                        None,
                    );
                    if attempt >= max_attempts {
                        return self
                            .last_resort(request, report_id, run_dir, section, &meta, &last_raw, ChapterErrorKind::Validation, attempt, &errors.join("; "), Some((invalid, errors)), stream)
                            .await;
                    }
                }
            }
        }

        let payload = payload.expect("chapter payload set on ladder exit");
        self.storage.persist_chapter(run_dir, &meta, &payload, &[])?;

        let mut completion = json!({
            "chapterId": section.chapter_id,
            "title": section.title,
            "status": "completed",
            "attempt": attempts_used,
        });
        if fallback_used {
            completion["warning"] = json!("content_sparse_fallback");
            completion["warningMessage"] = json!(CONTENT_SPARSE_WARNING_TEXT);
        }
        emit(stream, EventKind::ChapterStatus, completion);

        Ok(payload)
    }

    /// One streamed generation attempt for a chapter.
    async fn chapter_attempt(
        &self,
        section: &TemplateSection,
        user_prompt: &str,
        chapter_dir: &Path,
        stream: &Option<StreamHandler>,
    ) -> Result<Value, AttemptError> {
        let mut capture = self
            .storage
            .capture_stream(chapter_dir)
            .map_err(|e| AttemptError::Parse {
                message: format!("could not open stream capture: {e}"),
                raw: String::new(),
            })?;

        let (tx, mut rx) = mpsc::channel::<StreamChunk>(64);
        let llm = self.llm.clone();
        let request = CompletionRequest {
            system_prompt: SYSTEM_CHAPTER_GENERATION.to_string(),
            messages: vec![Message::user(user_prompt.to_string())],
            max_tokens: CHAPTER_MAX_TOKENS,
        };
        let call = tokio::spawn(async move { llm.stream(request, tx).await });

        while let Some(chunk) = rx.recv().await {
            if let StreamChunk::TextDelta(delta) = chunk {
                if let Err(e) = capture.write_delta(&delta) {
                    warn!(error = %e, "stream capture write failed");
                }
                emit(
                    stream,
                    EventKind::ChapterChunk,
                    json!({"chapterId": section.chapter_id, "title": section.title, "delta": delta}),
                );
            }
        }
        drop(capture);

        let response = match call.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(AttemptError::Llm(e)),
            Err(join_error) => {
                return Err(AttemptError::Parse {
                    message: format!("generation task aborted: {join_error}"),
                    raw: String::new(),
                });
            }
        };
        let raw = response.text().to_string();

        let context = format!("chapter {}", section.chapter_id);
        let mut payload = match self.parser.parse(&raw, &context, &[], None) {
            Ok(value) => value,
            Err(e) => {
                return Err(AttemptError::Parse {
                    message: e.message,
                    raw,
                });
            }
        };

        normalize_chapter_identity(&mut payload, section);

        let body_chars = body_character_count(&payload);
        if body_chars < CHAPTER_MIN_BODY_CHARS {
            return Err(AttemptError::Sparse {
                payload,
                body_chars,
            });
        }

        let (ok, errors) = self.validator.validate_chapter(&payload);
        if !ok {
            return Err(AttemptError::Validation {
                errors,
                payload,
                raw,
            });
        }

        Ok(payload)
    }

    /// Final rung of the ladder for parse/validation failures: walk the
    /// rescue clients, then quarantine and surface.
    #[allow(clippy::too_many_arguments)]
    async fn last_resort(
        &self,
        request: &ReportRequest,
        report_id: &str,
        run_dir: &Path,
        section: &TemplateSection,
        meta: &ChapterMeta,
        raw: &str,
        kind: ChapterErrorKind,
        attempts: u32,
        message: &str,
        invalid: Option<(Value, Vec<String>)>,
        stream: &Option<StreamHandler>,
    ) -> Result<Value, PipelineError> {
        if let Some(rescued) = self.attempt_rescue(request, section, raw, message).await {
            info!(chapter = %section.chapter_id, "chapter recovered through rescue client");
            self.storage.persist_chapter(run_dir, meta, &rescued, &[])?;
            emit(
                stream,
                EventKind::ChapterStatus,
                json!({
                    "chapterId": section.chapter_id,
                    "title": section.title,
                    "status": "completed",
                    "attempt": attempts,
                    "warning": "json_recovery_fallback",
                }),
            );
            return Ok(rescued);
        }

        write_quarantine(&self.config.json_error_log_dir, report_id, &section.slug, raw);
        if let Some((payload, errors)) = invalid {
            // Keep the failed structure on disk for forensics.
            self.storage.persist_chapter(run_dir, meta, &payload, &errors)?;
        }
        emit(
            stream,
            EventKind::ChapterStatus,
            json!({
                "chapterId": section.chapter_id,
                "title": section.title,
                "status": "error",
                "attempt": attempts,
                "error": message,
            }),
        );
        Err(PipelineError::ChapterFailed {
            chapter: section.chapter_id.clone(),
            kind,
            attempts,
            message: message.to_string(),
        })
    }

    /// Hand the raw failed output to each rescue client in turn; the first
    /// chapter that passes validation wins.
    async fn attempt_rescue(
        &self,
        request: &ReportRequest,
        section: &TemplateSection,
        raw: &str,
        error: &str,
    ) -> Option<Value> {
        if self.rescue_clients.is_empty() || raw.trim().is_empty() {
            return None;
        }
        let data = json!({
            "section": serde_json::to_string(section).unwrap_or_default(),
            "context_digest": request.query,
            "raw_output": raw,
            "error": error,
        });
        let user_prompt = self.prompts.render("chapter_json_recovery", &data).ok()?;

        for (label, client) in &self.rescue_clients {
            debug!(label, chapter = %section.chapter_id, "attempting JSON recovery");
            let response = client
                .complete(CompletionRequest {
                    system_prompt: SYSTEM_PROMPT_CHAPTER_JSON_RECOVERY.to_string(),
                    messages: vec![Message::user(user_prompt.clone())],
                    max_tokens: CHAPTER_MAX_TOKENS,
                })
                .await;
            let Ok(response) = response else {
                warn!(label, "rescue client call failed");
                continue;
            };
            let context = format!("chapter rescue {}", section.chapter_id);
            let Ok(mut payload) = self.parser.parse(response.text(), &context, &[], None) else {
                warn!(label, "rescue output unparseable");
                continue;
            };
            normalize_chapter_identity(&mut payload, section);
            let (ok, errors) = self.validator.validate_chapter(&payload);
            if ok {
                return Some(payload);
            }
            warn!(label, ?errors, "rescued chapter failed validation");
        }
        None
    }

    // ======== persistence ========

    fn persist_planning_artifacts(
        &self,
        run_dir: &Path,
        layout: &Value,
        word_plan: &Value,
        template_overview: &Value,
    ) {
        for (name, value) in [
            ("document_layout.json", layout),
            ("word_plan.json", word_plan),
            ("template_overview.json", template_overview),
        ] {
            let path = run_dir.join(name);
            let body = serde_json::to_string_pretty(value).unwrap_or_default();
            if let Err(e) = fs::write(&path, body) {
                warn!(path = %path.display(), error = %e, "could not persist planning artifact");
            }
        }
    }

    fn save_outputs(
        &self,
        report_id: &str,
        html: &str,
        document_ir: &Value,
    ) -> Result<(PathBuf, PathBuf), PipelineError> {
        fs::create_dir_all(&self.config.final_reports_dir).map_err(|e| {
            reportstore::StoreError::Io {
                path: self.config.final_reports_dir.clone(),
                source: e,
            }
        })?;
        fs::create_dir_all(&self.config.ir_dir).map_err(|e| reportstore::StoreError::Io {
            path: self.config.ir_dir.clone(),
            source: e,
        })?;

        let html_path = self.config.final_reports_dir.join(format!("{report_id}.html"));
        fs::write(&html_path, html).map_err(|e| reportstore::StoreError::Io {
            path: html_path.clone(),
            source: e,
        })?;

        let ir_path = self.config.ir_dir.join(format!("{report_id}.json"));
        let body = serde_json::to_string_pretty(document_ir).unwrap_or_default();
        fs::write(&ir_path, body).map_err(|e| reportstore::StoreError::Io {
            path: ir_path.clone(),
            source: e,
        })?;

        Ok((html_path, ir_path))
    }
}

struct SelectedTemplate {
    name: String,
    content: String,
    reason: String,
}

impl SelectedTemplate {
    fn fallback() -> Self {
        Self {
            name: FALLBACK_TEMPLATE_NAME.to_string(),
            content: FALLBACK_TEMPLATE.to_string(),
            reason: "使用内置兜底模板".to_string(),
        }
    }
}

// ======== helpers ========

/// Bridge an async LLM client into the parser's synchronous repair hook.
/// Only valid on the multi-thread runtime.
fn llm_repair_hook(client: Arc<dyn LlmClient>) -> crate::jsonrepair::LlmRepairFn {
    Arc::new(move |raw, error| {
        let client = client.clone();
        let request = CompletionRequest {
            system_prompt: super::prompts::SYSTEM_JSON_REPAIR.to_string(),
            messages: vec![Message::user(format!("解析错误：{error}\n\n原始输出：\n{raw}"))],
            max_tokens: CHAPTER_MAX_TOKENS,
        };
        let result = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move { client.complete(request).await })
        });
        match result {
            Ok(response) => response.content,
            Err(e) => {
                warn!(error = %e, "LLM JSON repair call failed");
                None
            }
        }
    })
}

/// Invoke the stream handler, isolating the pipeline from its failures.
fn emit(stream: &Option<StreamHandler>, kind: EventKind, payload: Value) {
    let Some(handler) = stream else {
        return;
    };
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(kind, payload)));
    if result.is_err() {
        warn!(kind = %kind, "stream handler panicked; event dropped");
    }
}

fn emit_chapter_retry(
    stream: &Option<StreamHandler>,
    section: &TemplateSection,
    attempt: u32,
    max_attempts: u32,
    reason: &str,
    error: &str,
    warning: Option<&str>,
) {
    let status = if attempt < max_attempts || warning.is_some() {
        "retrying"
    } else {
        "error"
    };
    let mut payload = json!({
        "chapterId": section.chapter_id,
        "title": section.title,
        "status": status,
        "attempt": attempt,
        "reason": reason,
        "error": error,
    });
    if let Some(warning) = warning {
        payload["warning"] = json!(warning);
    }
    emit(stream, EventKind::ChapterStatus, payload);
}

/// Coerce the three engine reports into prompt-ready strings, in the fixed
/// order query/media/insight.
pub fn normalize_reports(reports: &[EngineReportInput]) -> Value {
    let keys = ["query_engine", "media_engine", "insight_engine"];
    let mut normalized = serde_json::Map::new();
    for (idx, key) in keys.iter().enumerate() {
        let value = reports.get(idx).map(EngineReportInput::stringify).unwrap_or_default();
        normalized.insert((*key).to_string(), json!(value));
    }
    Value::Object(normalized)
}

/// Shape-check a stage result into an object, extracting the best element
/// when the model returned a list.
fn ensure_mapping(value: Value, context: &str) -> Result<Value, PipelineError> {
    match value {
        Value::Object(_) => Ok(value),
        Value::Array(items) => {
            let best = items.into_iter().find(|item| item.is_object());
            match best {
                Some(item) => {
                    warn!(context, "stage returned a list, extracted first object element");
                    Ok(item)
                }
                None => Err(PipelineError::StageOutputFormat {
                    stage: context.to_string(),
                    message: "list without object elements".to_string(),
                }),
            }
        }
        Value::Null => Err(PipelineError::StageOutputFormat {
            stage: context.to_string(),
            message: "empty result".to_string(),
        }),
        other => Err(PipelineError::StageOutputFormat {
            stage: context.to_string(),
            message: format!("expected object, got {other}"),
        }),
    }
}

/// Clean the word plan: coerce `chapters` into a list of objects, wrap or
/// default `globalGuidelines`, default `totalWords`. An empty chapter list
/// is the one unrecoverable shape.
pub fn normalize_word_plan(mut plan: Value, stage: &str) -> Result<Value, PipelineError> {
    let raw_chapters = plan.get("chapters").cloned().unwrap_or(Value::Null);
    let iterable: Vec<Value> = match raw_chapters {
        Value::Array(items) => items,
        Value::Object(map) => map.into_values().collect(),
        _ => Vec::new(),
    };

    let mut normalized = Vec::new();
    for (idx, entry) in iterable.into_iter().enumerate() {
        match entry {
            Value::Object(_) => normalized.push(entry),
            Value::Array(items) => {
                if let Some(candidate) = items.into_iter().find(|i| i.is_object()) {
                    warn!(stage, idx = idx + 1, "chapter entry was a list, extracted first object");
                    normalized.push(candidate);
                } else {
                    warn!(stage, idx = idx + 1, "skipping unusable chapter entry");
                }
            }
            _ => warn!(stage, idx = idx + 1, "skipping non-object chapter entry"),
        }
    }

    if normalized.is_empty() {
        return Err(PipelineError::StageOutputFormat {
            stage: stage.to_string(),
            message: "no usable chapter plan".to_string(),
        });
    }
    plan["chapters"] = Value::Array(normalized);

    let guidelines = plan.get("globalGuidelines").cloned();
    match guidelines {
        Some(Value::Array(_)) => {}
        None | Some(Value::Null) => plan["globalGuidelines"] = json!([]),
        Some(Value::String(s)) if s.is_empty() => plan["globalGuidelines"] = json!([]),
        Some(other) => {
            warn!(stage, "globalGuidelines was not a list, wrapping");
            plan["globalGuidelines"] = json!([other]);
        }
    }

    if !plan.get("totalWords").is_some_and(Value::is_number) {
        warn!(stage, "totalWords missing or mistyped, defaulting to 10000");
        plan["totalWords"] = json!(10000);
    }

    Ok(plan)
}

/// At most one chapter may carry allowSwot and one allowPest; later
/// duplicates are cleared.
fn enforce_swot_pest_limits(layout: &mut Value) {
    let Some(plan) = layout.get_mut("tocPlan").and_then(Value::as_array_mut) else {
        return;
    };
    for flag in ["allowSwot", "allowPest"] {
        let mut seen = false;
        for entry in plan.iter_mut() {
            let is_set = entry.get(flag).and_then(Value::as_bool) == Some(true);
            if is_set {
                if seen {
                    warn!(flag, "multiple chapters claimed the flag, keeping the first");
                    entry[flag] = json!(false);
                } else {
                    seen = true;
                }
            }
        }
    }
}

fn chapter_directive(word_plan: &Value, chapter_id: &str) -> Value {
    word_plan
        .get("chapters")
        .and_then(Value::as_array)
        .and_then(|chapters| {
            chapters
                .iter()
                .find(|c| c.get("chapterId").and_then(Value::as_str) == Some(chapter_id))
        })
        .cloned()
        .unwrap_or_else(|| json!({}))
}

fn chapter_permissions(layout: &Value, chapter_id: &str) -> (bool, bool) {
    let entry = layout
        .get("tocPlan")
        .and_then(Value::as_array)
        .and_then(|plan| {
            plan.iter()
                .find(|e| e.get("chapterId").and_then(Value::as_str) == Some(chapter_id))
        });
    match entry {
        Some(entry) => (
            entry.get("allowSwot").and_then(Value::as_bool).unwrap_or(false),
            entry.get("allowPest").and_then(Value::as_bool).unwrap_or(false),
        ),
        None => (false, false),
    }
}

/// Fill identity fields the model tends to omit so validation and
/// composition see a complete chapter.
fn normalize_chapter_identity(payload: &mut Value, section: &TemplateSection) {
    let Some(obj) = payload.as_object_mut() else {
        return;
    };
    if !obj.get("chapterId").and_then(Value::as_str).is_some_and(|s| !s.is_empty()) {
        obj.insert("chapterId".to_string(), json!(section.chapter_id));
    }
    if !obj.get("title").and_then(Value::as_str).is_some_and(|s| !s.is_empty()) {
        obj.insert("title".to_string(), json!(section.title));
    }
    if !obj.get("anchor").and_then(Value::as_str).is_some_and(|s| !s.is_empty()) {
        obj.insert("anchor".to_string(), json!(section.slug));
    }
    if !obj.get("order").is_some_and(Value::is_number) {
        obj.insert("order".to_string(), json!(section.order));
    }
}

/// Total characters of narrative text inside the chapter's blocks.
pub fn body_character_count(payload: &Value) -> usize {
    fn walk(value: &Value, count: &mut usize) {
        match value {
            Value::Object(obj) => {
                if let Some(text) = obj.get("text").and_then(Value::as_str) {
                    *count += text.chars().count();
                }
                for (key, child) in obj {
                    if key != "text" {
                        walk(child, count);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item, count);
                }
            }
            _ => {}
        }
    }
    let mut count = 0;
    if let Some(blocks) = payload.get("blocks") {
        walk(blocks, &mut count);
    }
    count
}

/// Deep-copy the densest sparse candidate and prepend the warning
/// paragraph right after the first heading.
pub fn finalize_sparse_chapter(chapter: Value) -> Value {
    let mut safe = if chapter.is_object() { chapter } else { json!({}) };

    let warning_block = json!({
        "type": "paragraph",
        "inlines": [{"text": CONTENT_SPARSE_WARNING_TEXT, "marks": [{"type": "italic"}]}],
        "meta": {"role": "content-sparse-warning"},
    });

    match safe.get_mut("blocks").and_then(Value::as_array_mut) {
        Some(blocks) if !blocks.is_empty() => {
            let heading_idx = blocks
                .iter()
                .position(|b| b.get("type").and_then(Value::as_str) == Some("heading"));
            match heading_idx {
                Some(idx) => blocks.insert(idx + 1, warning_block),
                None => blocks.insert(0, warning_block),
            }
        }
        _ => {
            safe["blocks"] = json!([warning_block]);
        }
    }

    match safe.get_mut("meta").and_then(Value::as_object_mut) {
        Some(meta) => {
            meta.insert("contentSparseWarning".to_string(), json!(true));
        }
        None => {
            safe["meta"] = json!({"contentSparseWarning": true});
        }
    }

    safe
}

fn is_content_safety_message(message: &str) -> bool {
    let normalized = message.to_ascii_lowercase();
    CONTENT_SAFETY_KEYWORDS.iter().any(|k| normalized.contains(k))
}

/// Template title plus a digest of the sliced sections, used by the layout
/// and budget prompts and persisted for later inspection.
pub fn build_template_overview(template_text: &str, sections: &[TemplateSection]) -> Value {
    json!({
        "title": extract_template_title(template_text),
        "sectionCount": sections.len(),
        "sections": sections
            .iter()
            .map(|s| json!({
                "chapterId": s.chapter_id,
                "title": s.title,
                "outline": s.outline,
            }))
            .collect::<Vec<_>>(),
    })
}

fn extract_template_title(template_text: &str) -> String {
    for line in template_text.lines() {
        let trimmed = line.trim();
        if let Some(title) = trimmed.strip_prefix('#') {
            return title.trim_start_matches('#').trim().to_string();
        }
    }
    String::new()
}

fn build_manifest_meta(
    request: &ReportRequest,
    template: &SelectedTemplate,
    layout: &Value,
    word_plan: &Value,
    template_overview: &Value,
) -> Value {
    let title = layout
        .get("title")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            if request.query.is_empty() {
                template.name.clone()
            } else {
                format!("{} - 舆情洞察报告", request.query)
            }
        });

    let mut meta = json!({
        "query": request.query,
        "title": title,
        "subtitle": layout.get("subtitle"),
        "tagline": layout.get("tagline"),
        "templateName": template.name,
        "selectionReason": template.reason,
        "themeTokens": layout.get("themeTokens").cloned().unwrap_or_else(|| json!({})),
        "toc": {
            "depth": 3,
            "autoNumbering": true,
            "title": layout.get("tocTitle").and_then(Value::as_str).unwrap_or("目录"),
        },
        "hero": layout.get("hero"),
        "layoutNotes": layout.get("layoutNotes"),
        "wordPlan": {
            "totalWords": word_plan.get("totalWords"),
            "globalGuidelines": word_plan.get("globalGuidelines"),
        },
        "templateOverview": template_overview,
    });
    if let Some(plan) = layout.get("tocPlan").filter(|p| p.is_array()) {
        meta["toc"]["customEntries"] = plan.clone();
    }
    meta
}

/// Markdown templates available on disk, by display name (file stem).
fn list_templates(dir: &Path) -> Vec<(String, String)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut templates = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "md")
            && let Ok(content) = fs::read_to_string(&path)
        {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            templates.push((name, content));
        }
    }
    templates.sort();
    templates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::{MockLlmClient, MockOutcome};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn layout_json() -> String {
        json!({
            "title": "市政热点舆情分析报告",
            "subtitle": "阶段研判",
            "tagline": "",
            "tocTitle": "目录",
            "hero": {},
            "themeTokens": {"accent": "#0a7"},
            "tocPlan": [
                {"chapterId": "S1", "display": "综合分析", "description": "", "allowSwot": true},
                {"chapterId": "S2", "display": "研判", "description": ""}
            ],
            "layoutNotes": ""
        })
        .to_string()
    }

    fn word_plan_json() -> String {
        json!({
            "totalWords": 6000,
            "globalGuidelines": ["聚焦事实"],
            "chapters": [
                {"chapterId": "S1", "targetWords": 3000, "minWords": 2000, "maxWords": 5000,
                 "emphasis": ["走势"], "rationale": ""},
                {"chapterId": "S2", "targetWords": 3000, "minWords": 2000, "maxWords": 5000,
                 "emphasis": [], "rationale": ""}
            ]
        })
        .to_string()
    }

    fn long_text() -> String {
        "围绕本次舆情事件的发展脉络、传播渠道与公众情绪，本章进行系统梳理与研判。".repeat(6)
    }

    fn chapter_json(id: &str, title: &str, anchor: &str, order: i64) -> String {
        json!({
            "chapterId": id,
            "title": title,
            "anchor": anchor,
            "order": order,
            "blocks": [
                {"type": "heading", "level": 2, "text": title, "anchor": anchor},
                {"type": "paragraph", "inlines": [{"text": long_text(), "marks": []}]}
            ]
        })
        .to_string()
    }

    fn sparse_chapter_json(text: &str) -> String {
        json!({
            "chapterId": "S1",
            "title": "1.0 综合分析",
            "anchor": "section-1-0",
            "order": 10,
            "blocks": [
                {"type": "heading", "level": 2, "text": "1.0 综合分析", "anchor": "section-1-0"},
                {"type": "paragraph", "inlines": [{"text": text, "marks": []}]}
            ]
        })
        .to_string()
    }

    struct Fixture {
        pipeline: ReportPipeline,
        _temp: TempDir,
        quarantine_dir: PathBuf,
    }

    fn fixture(outcomes: Vec<MockOutcome>) -> Fixture {
        fixture_with_rescue(outcomes, Vec::new())
    }

    fn fixture_with_rescue(
        outcomes: Vec<MockOutcome>,
        rescue: Vec<(String, Arc<dyn LlmClient>)>,
    ) -> Fixture {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(ChapterStore::new(temp.path().join("chapters")).unwrap());
        let quarantine_dir = temp.path().join("json_repair_failures");
        let config = PipelineConfig {
            template_dir: temp.path().join("templates"),
            json_error_log_dir: quarantine_dir.clone(),
            final_reports_dir: temp.path().join("final_reports"),
            ir_dir: temp.path().join("final_reports").join("document_ir"),
            chapter_json_max_attempts: 3,
            structural_retry_attempts: 2,
        };
        let pipeline = ReportPipeline::new(Arc::new(MockLlmClient::new(outcomes)), storage, config)
            .with_rescue_clients(rescue);
        Fixture {
            pipeline,
            _temp: temp,
            quarantine_dir,
        }
    }

    fn collecting_handler() -> (StreamHandler, Arc<Mutex<Vec<(EventKind, Value)>>>) {
        let seen: Arc<Mutex<Vec<(EventKind, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: StreamHandler = Arc::new(move |kind, payload| {
            sink.lock().unwrap().push((kind, payload));
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn test_template_fallback_end_to_end() {
        // Empty reports, no templates on disk: the built-in fallback
        // drives a one-chapter report.
        let fixture = fixture(vec![
            MockOutcome::text(layout_json()),
            MockOutcome::text(word_plan_json()),
            MockOutcome::text(chapter_json("S1", "1.0 综合分析", "section-1-0", 10)),
        ]);
        let mut request = ReportRequest::new("市政热点");
        request.reports = vec![
            EngineReportInput::Text(String::new()),
            EngineReportInput::Text(String::new()),
            EngineReportInput::Text(String::new()),
        ];

        let result = fixture.pipeline.generate_report(request, None).await.unwrap();

        let chapters = result.document_ir["chapters"].as_array().unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0]["chapterId"], "S1");
        assert!(chapters[0]["title"].as_str().unwrap().starts_with("1.0"));
        assert_eq!(chapters[0]["anchor"], "section-1-0");

        assert!(result.html.contains("市政热点舆情分析报告"));
        assert!(result.html_path.unwrap().exists());
        assert!(result.ir_path.unwrap().exists());

        // Manifest records the chapter as ready.
        let manifest_text =
            fs::read_to_string(result.run_dir.join("manifest.json")).unwrap();
        assert!(manifest_text.contains("\"status\": \"ready\""));
        // Planning artifacts persisted alongside.
        assert!(result.run_dir.join("document_layout.json").exists());
        assert!(result.run_dir.join("word_plan.json").exists());
        assert!(result.run_dir.join("template_overview.json").exists());
    }

    #[tokio::test]
    async fn test_custom_template_multi_chapter() {
        let fixture = fixture(vec![
            MockOutcome::text(layout_json()),
            MockOutcome::text(word_plan_json()),
            MockOutcome::text(chapter_json("S1", "1.0 事件回顾", "section-1-0", 10)),
            MockOutcome::text(chapter_json("S2", "2.0 风险研判", "section-2-0", 20)),
        ]);
        let mut request = ReportRequest::new("某事件");
        request.custom_template = "# 1.0 事件回顾\n\n# 2.0 风险研判\n".to_string();

        let (handler, seen) = collecting_handler();
        let result = fixture
            .pipeline
            .generate_report(request, Some(handler))
            .await
            .unwrap();

        let chapters = result.document_ir["chapters"].as_array().unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0]["order"], 10);
        assert_eq!(chapters[1]["order"], 20);

        let events = seen.lock().unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|(k, _)| *k).collect();
        assert!(kinds.contains(&EventKind::AgentStart));
        assert!(kinds.contains(&EventKind::TemplateSelected));
        assert!(kinds.contains(&EventKind::ChapterChunk));
        assert!(kinds.contains(&EventKind::ChaptersCompiled));
        assert!(kinds.contains(&EventKind::ReportSaved));
        assert!(kinds.contains(&EventKind::Metrics));
        let selected = events
            .iter()
            .find(|(k, _)| *k == EventKind::TemplateSelected)
            .unwrap();
        assert_eq!(selected.1["template"], "自定义模板");
    }

    #[tokio::test]
    async fn test_sparse_chapter_fallback() {
        // Three consecutive sparse generations: the densest candidate is
        // accepted with the inline warning.
        let fixture = fixture(vec![
            MockOutcome::text(layout_json()),
            MockOutcome::text(word_plan_json()),
            MockOutcome::text(sparse_chapter_json("短文本。")),
            MockOutcome::text(sparse_chapter_json("这是三次尝试里最长的一段稀疏内容，应当被保留。")),
            MockOutcome::text(sparse_chapter_json("中等长度的稀疏内容。")),
        ]);
        let request = ReportRequest::new("稀疏案例");

        let result = fixture.pipeline.generate_report(request, None).await.unwrap();

        let chapter = &result.document_ir["chapters"][0];
        assert_eq!(chapter["meta"]["contentSparseWarning"], true);
        // Warning paragraph sits right after the heading, in italics.
        let blocks = chapter["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "heading");
        assert_eq!(blocks[1]["inlines"][0]["text"], CONTENT_SPARSE_WARNING_TEXT);
        assert_eq!(blocks[1]["inlines"][0]["marks"][0]["type"], "italic");
        // The densest candidate survived.
        assert!(
            blocks
                .iter()
                .any(|b| b["inlines"][0]["text"]
                    .as_str()
                    .is_some_and(|t| t.contains("最长的一段稀疏内容")))
        );
        // Manifest still records the chapter as ready.
        let manifest_text =
            fs::read_to_string(result.run_dir.join("manifest.json")).unwrap();
        assert!(manifest_text.contains("\"status\": \"ready\""));
    }

    #[tokio::test]
    async fn test_rescue_client_recovers_unparseable_chapter() {
        let rescue_client: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(vec![
            MockOutcome::text(chapter_json("S1", "1.0 综合分析", "section-1-0", 10)),
        ]));
        let fixture = fixture_with_rescue(
            vec![
                MockOutcome::text(layout_json()),
                MockOutcome::text(word_plan_json()),
                MockOutcome::text("@@@completely broken output@@@"),
                MockOutcome::text("@@@still broken@@@"),
                MockOutcome::text("@@@broken again@@@"),
            ],
            vec![("insight".to_string(), rescue_client)],
        );
        let request = ReportRequest::new("需要救援");

        let (handler, seen) = collecting_handler();
        let result = fixture
            .pipeline
            .generate_report(request, Some(handler))
            .await
            .unwrap();

        assert_eq!(result.document_ir["chapters"].as_array().unwrap().len(), 1);
        let events = seen.lock().unwrap();
        assert!(
            events
                .iter()
                .any(|(_, p)| p.get("warning").and_then(Value::as_str)
                    == Some("json_recovery_fallback"))
        );
    }

    #[tokio::test]
    async fn test_parse_failure_without_rescue_quarantines() {
        let fixture = fixture(vec![
            MockOutcome::text(layout_json()),
            MockOutcome::text(word_plan_json()),
            MockOutcome::text("@@@broken@@@"),
            MockOutcome::text("@@@broken@@@"),
            MockOutcome::text("@@@broken@@@"),
        ]);
        let mut request = ReportRequest::new("坏输出");
        request.report_id = Some("report-test".to_string());

        let error = fixture.pipeline.generate_report(request, None).await.unwrap_err();
        match error {
            PipelineError::ChapterFailed { kind, attempts, .. } => {
                assert_eq!(kind, ChapterErrorKind::ParseFail);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(
            fixture
                .quarantine_dir
                .join("report-test_section-1-0.raw.txt")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_content_safety_errors_are_retried() {
        let fixture = fixture(vec![
            MockOutcome::text(layout_json()),
            MockOutcome::text(word_plan_json()),
            MockOutcome::api_error(400, "Request blocked by content moderation policy"),
            MockOutcome::text(chapter_json("S1", "1.0 综合分析", "section-1-0", 10)),
        ]);
        let request = ReportRequest::new("边界案例");

        let result = fixture.pipeline.generate_report(request, None).await.unwrap();
        assert_eq!(result.document_ir["chapters"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_surfaces_immediately() {
        let fixture = fixture(vec![
            MockOutcome::text(layout_json()),
            MockOutcome::text(word_plan_json()),
            MockOutcome::api_error(500, "backend exploded"),
        ]);
        let request = ReportRequest::new("传输失败");

        let error = fixture.pipeline.generate_report(request, None).await.unwrap_err();
        assert!(matches!(error, PipelineError::Llm(_)));
    }

    #[tokio::test]
    async fn test_stage_format_error_retried_once() {
        let fixture = fixture(vec![
            // First layout attempt is prose; the retry returns real JSON.
            MockOutcome::text("抱歉，我需要更多信息。"),
            MockOutcome::text(layout_json()),
            MockOutcome::text(word_plan_json()),
            MockOutcome::text(chapter_json("S1", "1.0 综合分析", "section-1-0", 10)),
        ]);
        let request = ReportRequest::new("结构重试");

        let result = fixture.pipeline.generate_report(request, None).await.unwrap();
        assert_eq!(result.document_ir["chapters"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_before_stages() {
        let fixture = fixture(vec![]);
        let mut request = ReportRequest::new("取消");
        let flag = Arc::new(AtomicBool::new(true));
        request.cancel = Some(flag);

        let error = fixture.pipeline.generate_report(request, None).await.unwrap_err();
        assert!(matches!(error, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn test_panicking_stream_handler_is_isolated() {
        let fixture = fixture(vec![
            MockOutcome::text(layout_json()),
            MockOutcome::text(word_plan_json()),
            MockOutcome::text(chapter_json("S1", "1.0 综合分析", "section-1-0", 10)),
        ]);
        let request = ReportRequest::new("回调崩溃");
        let handler: StreamHandler = Arc::new(|_, _| panic!("handler bug"));

        let result = fixture.pipeline.generate_report(request, Some(handler)).await;
        assert!(result.is_ok());
    }

    // ======== unit-level helpers ========

    #[test]
    fn test_normalize_reports_fixed_order() {
        let normalized = normalize_reports(&[
            EngineReportInput::Text("查询报告".to_string()),
            EngineReportInput::Structured(json!({"k": 1})),
        ]);
        assert_eq!(normalized["query_engine"], "查询报告");
        assert!(normalized["media_engine"].as_str().unwrap().contains("\"k\": 1"));
        assert_eq!(normalized["insight_engine"], "");
    }

    #[test]
    fn test_normalize_word_plan_defaults() {
        let plan = json!({
            "chapters": [
                {"chapterId": "S1"},
                "noise",
                [{"chapterId": "S2"}, "x"],
            ],
            "globalGuidelines": "单条指引",
            "totalWords": "很多",
        });
        let normalized = normalize_word_plan(plan, "test").unwrap();
        let chapters = normalized["chapters"].as_array().unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1]["chapterId"], "S2");
        assert_eq!(normalized["globalGuidelines"], json!(["单条指引"]));
        assert_eq!(normalized["totalWords"], 10000);
    }

    #[test]
    fn test_normalize_word_plan_rejects_empty() {
        let error = normalize_word_plan(json!({"chapters": []}), "test").unwrap_err();
        assert!(matches!(error, PipelineError::StageOutputFormat { .. }));
    }

    #[test]
    fn test_enforce_swot_pest_limits() {
        let mut layout = json!({
            "tocPlan": [
                {"chapterId": "S1", "allowSwot": true, "allowPest": true},
                {"chapterId": "S2", "allowSwot": true},
                {"chapterId": "S3", "allowPest": true},
            ]
        });
        enforce_swot_pest_limits(&mut layout);
        let plan = layout["tocPlan"].as_array().unwrap();
        assert_eq!(plan[0]["allowSwot"], true);
        assert_eq!(plan[0]["allowPest"], true);
        assert_eq!(plan[1]["allowSwot"], false);
        assert_eq!(plan[2]["allowPest"], false);
    }

    #[test]
    fn test_body_character_count() {
        let payload = json!({
            "blocks": [
                {"type": "heading", "level": 2, "text": "标题", "anchor": "a"},
                {"type": "paragraph", "inlines": [{"text": "四个字符"}]},
                {"type": "list", "listType": "bullet",
                 "items": [[{"type": "paragraph", "inlines": [{"text": "再来五个字"}]}]]},
            ]
        });
        assert_eq!(body_character_count(&payload), 2 + 4 + 5);
    }

    #[test]
    fn test_finalize_sparse_inserts_after_heading() {
        let chapter = json!({
            "blocks": [
                {"type": "heading", "level": 2, "text": "t", "anchor": "a"},
                {"type": "paragraph", "inlines": [{"text": "内容"}]},
            ],
            "meta": {"existing": 1},
        });
        let finalized = finalize_sparse_chapter(chapter);
        let blocks = finalized["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1]["meta"]["role"], "content-sparse-warning");
        assert_eq!(finalized["meta"]["contentSparseWarning"], true);
        assert_eq!(finalized["meta"]["existing"], 1);
    }

    #[test]
    fn test_finalize_sparse_without_heading() {
        let finalized = finalize_sparse_chapter(json!({"blocks": [
            {"type": "paragraph", "inlines": [{"text": "正文"}]},
        ]}));
        let blocks = finalized["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["meta"]["role"], "content-sparse-warning");
    }

    #[test]
    fn test_content_safety_keywords() {
        assert!(is_content_safety_message("API error 400: Inappropriate Content detected"));
        assert!(is_content_safety_message("model-studio/error-code 42"));
        assert!(!is_content_safety_message("rate limited"));
    }

    #[test]
    fn test_template_overview() {
        let sections = parse_template_sections("# 1.0 概述\n- 要点一\n# 2.0 研判\n");
        let overview = build_template_overview("# 1.0 概述\n", &sections);
        assert_eq!(overview["title"], "1.0 概述");
        assert_eq!(overview["sectionCount"], 2);
    }
}
