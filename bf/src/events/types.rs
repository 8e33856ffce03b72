//! Event types for task activity streaming

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The vocabulary of observable pipeline activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentStart,
    TemplateSelected,
    TemplateSliced,
    LayoutDesigned,
    WordPlanReady,
    StorageReady,
    ChapterStatus,
    ChapterChunk,
    Progress,
    ChaptersCompiled,
    HtmlRendered,
    ReportSaved,
    Metrics,
    Error,
    Completed,
    Cancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentStart => "agent_start",
            EventKind::TemplateSelected => "template_selected",
            EventKind::TemplateSliced => "template_sliced",
            EventKind::LayoutDesigned => "layout_designed",
            EventKind::WordPlanReady => "word_plan_ready",
            EventKind::StorageReady => "storage_ready",
            EventKind::ChapterStatus => "chapter_status",
            EventKind::ChapterChunk => "chapter_chunk",
            EventKind::Progress => "progress",
            EventKind::ChaptersCompiled => "chapters_compiled",
            EventKind::HtmlRendered => "html_rendered",
            EventKind::ReportSaved => "report_saved",
            EventKind::Metrics => "metrics",
            EventKind::Error => "error",
            EventKind::Completed => "completed",
            EventKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event in a task's stream. Ids are assigned by the bus and strictly
/// increase within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}
