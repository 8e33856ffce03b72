//! REST endpoint handlers.
//!
//! Non-stream responses use the `{success: bool, ...}` envelope with 400
//! for client errors, 404 for unknown resources and 503 when a dependency
//! is missing.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path as UrlPath, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use reportstore::Engine;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::config::{self, Settings};
use crate::events::EventKind;
use crate::forum::parse_forum_line;
use crate::llm::{LlmClient, create_client};
use crate::report::pipeline::{EngineReportInput, PipelineConfig, ReportRequest, StreamHandler};
use crate::report::{PipelineError, ReportPipeline};

use super::tasks::TaskStatus;
use super::{AppState, SharedState};

/// Default query when the operator does not supply one.
const DEFAULT_QUERY: &str = "最新舆情综合分析";

/// Log tail responses are capped at 10 MiB from EOF.
const LOG_TAIL_CAP: u64 = 10 * 1024 * 1024;

fn ok(mut body: Value) -> Response {
    body["success"] = json!(true);
    Json(body).into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({"success": false, "error": message.into()})),
    )
        .into_response()
}

// ======== status ========

pub async fn get_status(State(state): State<SharedState>) -> Response {
    let system = state.supervisor.status().await;
    let task = state.registry.latest().map(|t| serde_json::to_value(t).unwrap_or(Value::Null));
    ok(json!({"system": system, "task": task}))
}

pub async fn system_status(State(state): State<SharedState>) -> Response {
    let settings = state.settings();
    let system = state.supervisor.status().await;
    let readiness = state.baseline.check_new_files(&settings.report_dirs());
    ok(json!({"system": system, "readiness": readiness}))
}

pub async fn system_start(State(state): State<SharedState>) -> Response {
    let settings = state.settings();
    match state.supervisor.initialize(&settings).await {
        Ok(()) => {
            // A fresh baseline marks "everything after this point is new".
            if let Err(e) = state.baseline.initialize(&settings.report_dirs()) {
                warn!(error = %e, "baseline initialization failed");
            }
            ok(json!({"message": "system started"}))
        }
        Err(errors) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "errors": errors})),
        )
            .into_response(),
    }
}

pub async fn system_shutdown(State(state): State<SharedState>) -> Response {
    let settings = state.settings();
    state
        .supervisor
        .async_shutdown(settings.shutdown_cleanup_timeout, settings.child_stop_grace);
    ok(json!({"message": "shutdown scheduled"}))
}

// ======== report generation ========

#[derive(Debug, Default, Deserialize)]
pub struct GenerateBody {
    pub query: Option<String>,
    pub custom_template: Option<String>,
    /// Skip the baseline readiness gate.
    #[serde(default)]
    pub force: bool,
}

pub async fn generate_report(
    State(state): State<SharedState>,
    body: Option<Json<GenerateBody>>,
) -> Response {
    if state.supervisor.is_shutting_down() {
        return fail(StatusCode::SERVICE_UNAVAILABLE, "shutdown in progress");
    }
    let body = body.map(|Json(inner)| inner).unwrap_or_default();
    let settings = state.settings();

    if !settings.report.is_configured() {
        return fail(
            StatusCode::SERVICE_UNAVAILABLE,
            "REPORT_ENGINE_API_KEY is not configured",
        );
    }

    if !body.force {
        let readiness = state.baseline.check_new_files(&settings.report_dirs());
        if !readiness.ready {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": "engines have not produced new reports since the baseline",
                    "readiness": readiness,
                })),
            )
                .into_response();
        }
    }

    let query = body
        .query
        .filter(|q| !q.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_QUERY.to_string());
    let task = match state.registry.create(query.clone()) {
        Ok(task) => task,
        Err(e) => return fail(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let custom_template = body.custom_template.unwrap_or_default();
    let task_id = task.task_id.clone();
    tokio::spawn(run_report_worker(
        state.clone(),
        task_id.clone(),
        query,
        custom_template,
    ));

    ok(json!({
        "task_id": task_id,
        "stream_url": format!("/api/report/stream/{task_id}"),
    }))
}

/// The dedicated worker for one report task.
async fn run_report_worker(
    state: SharedState,
    task_id: String,
    query: String,
    custom_template: String,
) {
    let settings = state.settings();
    state.registry.set_status(&task_id, TaskStatus::Running);

    let llm = match create_client("report", &settings.report, settings.llm_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "report client unavailable");
            finish_error(&state, &task_id, &e.to_string());
            return;
        }
    };
    let rescue = rescue_clients(&settings);

    let mut pipeline = ReportPipeline::new(
        llm.clone(),
        state.storage.clone(),
        PipelineConfig::from_settings(&settings),
    )
    .with_rescue_clients(rescue);
    if settings.enable_llm_repair {
        pipeline = pipeline.with_llm_repair(llm);
    }

    let reports = load_engine_reports(&state, &settings);
    let forum_logs = fs::read_to_string(settings.forum_log_path()).unwrap_or_default();
    let cancel = state
        .registry
        .get(&task_id)
        .map(|t| t.cancel.clone())
        .unwrap_or_default();

    let request = ReportRequest {
        report_id: Some(task_id.clone()),
        query,
        reports,
        forum_logs,
        custom_template,
        save_report: true,
        cancel: Some(cancel),
    };

    let stream = progress_stream_handler(&state, &task_id);
    match pipeline.generate_report(request, Some(stream)).await {
        Ok(result) => {
            info!(%task_id, "report task completed");
            state.registry.update(&task_id, |task| {
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.html_path = result.html_path.as_ref().map(|p| p.display().to_string());
                task.ir_path = result.ir_path.as_ref().map(|p| p.display().to_string());
            });
            state.bus.publish(
                &task_id,
                EventKind::Completed,
                json!({
                    "status": "completed",
                    "html": result.html_path.map(|p| p.display().to_string()),
                    "ir": result.ir_path.map(|p| p.display().to_string()),
                }),
            );
            // Consume the artifacts: the next report requires fresh ones.
            if let Err(e) = state.baseline.initialize(&settings.report_dirs()) {
                warn!(error = %e, "baseline refresh failed");
            }
        }
        Err(PipelineError::Cancelled) => {
            info!(%task_id, "report task cancelled");
            state.registry.set_status(&task_id, TaskStatus::Cancelled);
            state.bus.publish(
                &task_id,
                EventKind::Cancelled,
                json!({"status": "cancelled", "message": "generation stopped at a stage boundary"}),
            );
        }
        Err(e) => {
            error!(%task_id, error = %e, "report task failed");
            finish_error(&state, &task_id, &e.to_string());
        }
    }
    state.bus.mark_terminal(&task_id);
}

fn finish_error(state: &SharedState, task_id: &str, message: &str) {
    state.registry.update(task_id, |task| {
        task.status = TaskStatus::Error;
        task.error = Some(message.to_string());
    });
    state.bus.publish(
        task_id,
        EventKind::Error,
        json!({"status": "error", "message": message}),
    );
    state.bus.mark_terminal(task_id);
}

/// Bridge pipeline events into the bus and the registry's progress view.
fn progress_stream_handler(state: &SharedState, task_id: &str) -> StreamHandler {
    let state = state.clone();
    let task_id = task_id.to_string();
    Arc::new(move |kind, payload| {
        if kind == EventKind::Progress {
            let progress = payload.get("progress").and_then(Value::as_u64).unwrap_or(0);
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            state.registry.update(&task_id, |task| {
                task.progress = progress.min(100) as u8;
                task.message = message;
            });
        }
        state.bus.publish(&task_id, kind, payload);
    })
}

/// Rescue credentials in fixed preference order.
fn rescue_clients(settings: &Settings) -> Vec<(String, Arc<dyn LlmClient>)> {
    let mut clients = Vec::new();
    for (label, creds) in [
        ("report", &settings.report),
        ("forum", &settings.forum_host),
        ("insight", &settings.insight),
        ("media", &settings.media),
    ] {
        if !creds.is_configured() {
            continue;
        }
        match create_client(label, creds, settings.llm_timeout) {
            Ok(client) => clients.push((label.to_string(), client)),
            Err(e) => warn!(label, error = %e, "rescue client unavailable"),
        }
    }
    clients
}

/// Latest artifact per engine, coerced into pipeline order
/// (query, media, insight).
fn load_engine_reports(state: &SharedState, settings: &Settings) -> Vec<EngineReportInput> {
    let latest = state.baseline.latest_files(&settings.report_dirs());
    [Engine::Query, Engine::Media, Engine::Insight]
        .into_iter()
        .map(|engine| {
            let text = latest
                .get(&engine)
                .and_then(|path| fs::read_to_string(path).ok())
                .unwrap_or_default();
            EngineReportInput::Text(text)
        })
        .collect()
}

// ======== task queries ========

pub async fn get_progress(
    State(state): State<SharedState>,
    UrlPath(task_id): UrlPath<String>,
) -> Response {
    match state.registry.get(&task_id) {
        Some(task) => ok(json!({"task": task})),
        // Evicted tasks were terminal by definition.
        None => ok(json!({
            "task": {
                "task_id": task_id,
                "status": "completed",
                "progress": 100,
                "synthetic": true,
            }
        })),
    }
}

pub async fn get_result(
    State(state): State<SharedState>,
    UrlPath(task_id): UrlPath<String>,
) -> Response {
    let Some(task) = state.registry.get(&task_id) else {
        return fail(StatusCode::NOT_FOUND, "unknown task");
    };
    let Some(html_path) = task.html_path else {
        return fail(StatusCode::NOT_FOUND, "no result available for this task");
    };
    match fs::read_to_string(&html_path) {
        Ok(html) => Html(html).into_response(),
        Err(e) => fail(StatusCode::NOT_FOUND, format!("result file unreadable: {e}")),
    }
}

pub async fn download_result(
    State(state): State<SharedState>,
    UrlPath(task_id): UrlPath<String>,
) -> Response {
    let Some(task) = state.registry.get(&task_id) else {
        return fail(StatusCode::NOT_FOUND, "unknown task");
    };
    let Some(html_path) = task.html_path else {
        return fail(StatusCode::NOT_FOUND, "no result available for this task");
    };
    match fs::read(&html_path) {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "text/html; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{task_id}.html\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => fail(StatusCode::NOT_FOUND, format!("result file unreadable: {e}")),
    }
}

pub async fn cancel_task(
    State(state): State<SharedState>,
    UrlPath(task_id): UrlPath<String>,
) -> Response {
    let Some(task) = state.registry.get(&task_id) else {
        return fail(StatusCode::NOT_FOUND, "unknown task");
    };
    if task.status.is_terminal() {
        return fail(StatusCode::BAD_REQUEST, "task already finished");
    }

    // Cooperative: the flag is honored at stage boundaries; in-flight LLM
    // calls run to completion.
    task.request_cancel();
    state.registry.set_status(&task_id, TaskStatus::Cancelled);
    state.bus.publish(
        &task_id,
        EventKind::Cancelled,
        json!({"status": "cancelled", "message": "cancellation requested by operator"}),
    );
    state.bus.mark_terminal(&task_id);
    ok(json!({"task_id": task_id}))
}

// ======== logs and templates ========

pub async fn list_report_templates(State(state): State<SharedState>) -> Response {
    let settings = state.settings();
    let mut templates = Vec::new();
    if let Ok(entries) = fs::read_dir(&settings.template_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "md")
                && let Some(stem) = path.file_stem()
            {
                templates.push(stem.to_string_lossy().into_owned());
            }
        }
    }
    templates.sort();
    ok(json!({"templates": templates}))
}

pub async fn tail_report_log(State(state): State<SharedState>) -> Response {
    let settings = state.settings();
    match tail_file(&settings.report_log_path(), LOG_TAIL_CAP) {
        Some(content) => ok(json!({"log": content})),
        None => ok(json!({"log": ""})),
    }
}

pub async fn get_forum_log(State(state): State<SharedState>) -> Response {
    let settings = state.settings();
    let content = fs::read_to_string(settings.forum_log_path()).unwrap_or_default();
    let entries: Vec<_> = content.lines().filter_map(parse_forum_line).collect();
    ok(json!({"entries": entries}))
}

/// Read at most `cap` bytes from the end of a file.
fn tail_file(path: &Path, cap: u64) -> Option<String> {
    let mut file = fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let start = len.saturating_sub(cap);
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer).ok()?;
    Some(String::from_utf8_lossy(&buffer).into_owned())
}

// ======== config ========

pub async fn get_config(State(state): State<SharedState>) -> Response {
    let settings = state.settings();
    ok(json!({"config": settings.snapshot()}))
}

pub async fn update_config(
    State(state): State<SharedState>,
    Json(updates): Json<std::collections::BTreeMap<String, String>>,
) -> Response {
    if updates.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "no updates supplied");
    }
    if let Err(e) = config::persist_updates(&state.env_path, &updates) {
        return fail(StatusCode::BAD_REQUEST, e.to_string());
    }

    let reloaded = Settings::load_from(Some(&state.env_path));
    *state.settings.write().expect("settings lock") = reloaded;
    info!(keys = updates.len(), "configuration updated and reloaded");
    ok(json!({"updated": updates.keys().collect::<Vec<_>>()}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tail_file_caps_from_eof() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("report.log");
        fs::write(&path, "0123456789").unwrap();

        assert_eq!(tail_file(&path, 4).unwrap(), "6789");
        assert_eq!(tail_file(&path, 100).unwrap(), "0123456789");
        assert!(tail_file(&temp.path().join("missing.log"), 4).is_none());
    }
}
