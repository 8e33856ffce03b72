//! Integration tests for the HTTP/SSE surface.
//!
//! These spin up the real axum router on an ephemeral port and drive it
//! with reqwest, the same way operators and front-ends do.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use bettafish::config::Settings;
use bettafish::events::EventKind;
use bettafish::http::{AppState, TaskStatus, router};
use serde_json::{Value, json};
use tempfile::TempDir;

struct TestApp {
    base_url: String,
    state: Arc<AppState>,
    client: reqwest::Client,
    _temp: TempDir,
}

async fn spawn_app(mutate: impl FnOnce(&mut Settings, &TempDir)) -> TestApp {
    let temp = TempDir::new().expect("temp dir");
    let mut settings = Settings::default();
    settings.log_dir = temp.path().join("logs");
    settings.insight_report_dir = temp.path().join("insight_reports");
    settings.media_report_dir = temp.path().join("media_reports");
    settings.query_report_dir = temp.path().join("query_reports");
    settings.final_reports_dir = temp.path().join("final_reports");
    settings.template_dir = temp.path().join("templates");
    settings.json_error_log_dir = temp.path().join("logs/json_repair_failures");
    settings.baseline_file = temp.path().join("logs/report_baseline.json");
    for dir in [
        &settings.log_dir,
        &settings.insight_report_dir,
        &settings.media_report_dir,
        &settings.query_report_dir,
        &settings.template_dir,
    ] {
        fs::create_dir_all(dir).unwrap();
    }
    mutate(&mut settings, &temp);

    let env_path = temp.path().join(".env");
    fs::write(&env_path, "# test config\n").unwrap();
    let state = AppState::build(settings, env_path).expect("app state");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        state,
        client: reqwest::Client::new(),
        _temp: temp,
    }
}

#[tokio::test]
async fn test_status_endpoint() {
    let app = spawn_app(|_, _| {}).await;

    let body: Value = app
        .client
        .get(format!("{}/api/status", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(body["system"]["started"], false);
    assert!(body["task"].is_null());
}

#[tokio::test]
async fn test_system_status_includes_readiness() {
    let app = spawn_app(|_, _| {}).await;

    let body: Value = app
        .client
        .get(format!("{}/api/system/status", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(body["readiness"]["ready"], false);
}

#[tokio::test]
async fn test_generate_requires_report_credentials() {
    let app = spawn_app(|_, _| {}).await;

    let response = app
        .client
        .post(format!("{}/api/report/generate", app.base_url))
        .json(&json!({"query": "测试"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_generate_gated_by_baseline() {
    let app = spawn_app(|settings, _| {
        settings.report.api_key = Some("sk-test".to_string());
    })
    .await;

    let response = app
        .client
        .post(format!("{}/api/report/generate", app.base_url))
        .json(&json!({"query": "测试"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["readiness"]["ready"], false);
    let missing = body["readiness"]["missing"].as_array().unwrap();
    assert_eq!(missing.len(), 3);
}

#[tokio::test]
async fn test_progress_synthetic_for_evicted_task() {
    let app = spawn_app(|_, _| {}).await;

    let body: Value = app
        .client
        .get(format!("{}/api/report/progress/task-gone", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["task"]["status"], "completed");
    assert_eq!(body["task"]["synthetic"], true);
}

#[tokio::test]
async fn test_cancel_unknown_task_is_404() {
    let app = spawn_app(|_, _| {}).await;

    let response = app
        .client
        .post(format!("{}/api/report/cancel/task-nope", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_cancel_running_task() {
    let app = spawn_app(|_, _| {}).await;
    let task = app.state.registry.create("查询".to_string()).unwrap();
    app.state.registry.set_status(&task.task_id, TaskStatus::Running);

    let response = app
        .client
        .post(format!("{}/api/report/cancel/{}", app.base_url, task.task_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let updated = app.state.registry.get(&task.task_id).unwrap();
    assert_eq!(updated.status, TaskStatus::Cancelled);
    assert!(updated.cancel.load(std::sync::atomic::Ordering::SeqCst));

    // A second cancel is a client error.
    let response = app
        .client
        .post(format!("{}/api/report/cancel/{}", app.base_url, task.task_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

/// Read SSE frames until `count` `id:` lines arrived or the timeout hits.
async fn read_sse_ids(response: reqwest::Response, count: usize) -> Vec<u64> {
    use futures::StreamExt;

    let mut ids = Vec::new();
    let mut buffer = String::new();
    let mut stream = response.bytes_stream();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while ids.len() < count {
        let chunk = tokio::time::timeout_at(deadline, stream.next()).await;
        let Ok(Some(Ok(bytes))) = chunk else {
            break;
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));
        ids = buffer
            .lines()
            .filter_map(|line| line.strip_prefix("id: "))
            .filter_map(|id| id.trim().parse().ok())
            .collect();
    }
    ids
}

#[tokio::test]
async fn test_sse_replay_with_last_event_id() {
    let app = spawn_app(|_, _| {}).await;
    let task = app.state.registry.create("重连".to_string()).unwrap();
    app.state.registry.set_status(&task.task_id, TaskStatus::Running);

    for n in 1..=10 {
        app.state
            .bus
            .publish(&task.task_id, EventKind::Progress, json!({"n": n}));
    }

    // Reconnect having seen id 7: replay must deliver exactly 8, 9, 10.
    let response = app
        .client
        .get(format!("{}/api/report/stream/{}", app.base_url, task.task_id))
        .header("Last-Event-ID", "7")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // A live event published after subscription follows the replay.
    let state = app.state.clone();
    let task_id = task.task_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        state.bus.publish(&task_id, EventKind::Progress, json!({"n": 11}));
    });

    let ids = read_sse_ids(response, 4).await;
    assert_eq!(ids, vec![8, 9, 10, 11]);
}

#[tokio::test]
async fn test_sse_future_last_event_id_goes_straight_to_live() {
    let app = spawn_app(|_, _| {}).await;
    let task = app.state.registry.create("未来".to_string()).unwrap();
    app.state.registry.set_status(&task.task_id, TaskStatus::Running);
    for n in 1..=3 {
        app.state
            .bus
            .publish(&task.task_id, EventKind::Progress, json!({"n": n}));
    }

    let response = app
        .client
        .get(format!("{}/api/report/stream/{}", app.base_url, task.task_id))
        .header("Last-Event-ID", "99")
        .send()
        .await
        .unwrap();

    let state = app.state.clone();
    let task_id = task.task_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        state.bus.publish(&task_id, EventKind::Progress, json!({"n": "live"}));
    });

    // Nothing replayed; the first frame is the live event with id 4.
    let ids = read_sse_ids(response, 1).await;
    assert_eq!(ids, vec![4]);
}

#[tokio::test]
async fn test_sse_unknown_task_is_404() {
    let app = spawn_app(|_, _| {}).await;
    let response = app
        .client
        .get(format!("{}/api/report/stream/task-missing", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_templates_endpoint_lists_markdown() {
    let app = spawn_app(|settings, _| {
        fs::write(settings.template_dir.join("标准舆情模板.md"), "# 1.0 概述\n").unwrap();
        fs::write(settings.template_dir.join("notes.txt"), "ignored").unwrap();
    })
    .await;

    let body: Value = app
        .client
        .get(format!("{}/api/report/templates", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["templates"], json!(["标准舆情模板"]));
}

#[tokio::test]
async fn test_forum_log_endpoint_parses_entries() {
    let app = spawn_app(|settings, _| {
        fs::write(
            settings.log_dir.join("forum.log"),
            "[10:00:01] [SYSTEM] === start ===\n[10:00:02] [INSIGHT] 某个观点\nnot-a-forum-line\n",
        )
        .unwrap();
    })
    .await;

    let body: Value = app
        .client
        .get(format!("{}/api/forum/log", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1]["source"], "INSIGHT");
    assert_eq!(entries[1]["content"], "某个观点");
}

#[tokio::test]
async fn test_config_round_trip() {
    let app = spawn_app(|_, _| {}).await;

    let updates: BTreeMap<String, String> =
        BTreeMap::from([("PORT".to_string(), "8088".to_string())]);
    let response = app
        .client
        .post(format!("{}/api/config", app.base_url))
        .json(&updates)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // Reload happened: the snapshot reflects the new value.
    let body: Value = app
        .client
        .get(format!("{}/api/config", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["config"]["PORT"], "8088");

    // The .env file kept its comment and gained the key.
    let env_text = fs::read_to_string(&app.state.env_path).unwrap();
    assert!(env_text.starts_with("# test config"));
    assert!(env_text.contains("PORT=8088"));
}

#[tokio::test]
async fn test_config_rejects_unknown_key() {
    let app = spawn_app(|_, _| {}).await;

    let updates: BTreeMap<String, String> =
        BTreeMap::from([("NOT_A_KEY".to_string(), "x".to_string())]);
    let response = app
        .client
        .post(format!("{}/api/config", app.base_url))
        .json(&updates)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn test_result_missing_is_404() {
    let app = spawn_app(|_, _| {}).await;
    let task = app.state.registry.create("无结果".to_string()).unwrap();

    let response = app
        .client
        .get(format!("{}/api/report/result/{}", app.base_url, task.task_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_download_serves_attachment() {
    let app = spawn_app(|_, _| {}).await;
    let html_path = app.state.env_path.parent().unwrap().join("result.html");
    fs::write(&html_path, "<html>报告</html>").unwrap();

    let task = app.state.registry.create("下载".to_string()).unwrap();
    app.state.registry.update(&task.task_id, |t| {
        t.status = TaskStatus::Completed;
        t.html_path = Some(html_path.display().to_string());
    });

    let response = app
        .client
        .get(format!("{}/api/report/download/{}", app.base_url, task.task_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let disposition = response
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("attachment"));
    assert_eq!(response.text().await.unwrap(), "<html>报告</html>");
}
