//! HTTP/SSE surface
//!
//! REST endpoints plus the per-task SSE stream. All shared state hangs off
//! one `AppState` value; long-running work (report generation) runs on
//! dedicated tasks, never on request handlers.

mod api;
mod sse;
mod tasks;

pub use tasks::{ReportTask, TaskRegistry, TaskStatus};

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use axum::Router;
use axum::routing::{get, post};
use eyre::{Context, Result};
use reportstore::{BaselineStore, ChapterStore};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Settings;
use crate::events::EventBus;
use crate::supervisor::Supervisor;

/// Shared application state
pub struct AppState {
    pub settings: RwLock<Settings>,
    pub env_path: PathBuf,
    pub supervisor: Arc<Supervisor>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<TaskRegistry>,
    pub baseline: Arc<BaselineStore>,
    pub storage: Arc<ChapterStore>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn build(settings: Settings, env_path: PathBuf) -> Result<SharedState> {
        let storage =
            ChapterStore::new(settings.chapters_dir()).context("Failed to open chapter store")?;
        let baseline = BaselineStore::open(&settings.baseline_file);
        let registry = TaskRegistry::new(settings.task_registry_capacity);
        Ok(Arc::new(AppState {
            settings: RwLock::new(settings),
            env_path,
            supervisor: Arc::new(Supervisor::new()),
            bus: Arc::new(EventBus::default()),
            registry: Arc::new(registry),
            baseline: Arc::new(baseline),
            storage: Arc::new(storage),
        }))
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Settings {
        self.settings.read().expect("settings lock").clone()
    }
}

/// Build the API router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/status", get(api::get_status))
        .route("/api/report/generate", post(api::generate_report))
        .route("/api/report/progress/:task_id", get(api::get_progress))
        .route("/api/report/stream/:task_id", get(sse::stream_task))
        .route("/api/report/result/:task_id", get(api::get_result))
        .route("/api/report/download/:task_id", get(api::download_result))
        .route("/api/report/cancel/:task_id", post(api::cancel_task))
        .route("/api/report/templates", get(api::list_report_templates))
        .route("/api/report/log", get(api::tail_report_log))
        .route("/api/forum/log", get(api::get_forum_log))
        .route("/api/system/status", get(api::system_status))
        .route("/api/system/start", post(api::system_start))
        .route("/api/system/shutdown", post(api::system_shutdown))
        .route("/api/config", get(api::get_config).post(api::update_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: SharedState) -> Result<()> {
    let (host, port) = {
        let settings = state.settings();
        (settings.host, settings.port)
    };
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind {addr}"))?;
    info!(%addr, "HTTP server listening");

    // Terminal event channels are swept on a slow cadence.
    let bus = state.bus.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            ticker.tick().await;
            bus.sweep_expired();
        }
    });

    axum::serve(listener, router(state))
        .await
        .context("HTTP server failed")?;
    Ok(())
}
