//! Report task registry.
//!
//! Tasks live in memory only and the registry is bounded: the most recent
//! N by creation time are retained, with non-terminal tasks never evicted.
//! At most one task may be in flight at any time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

/// Report task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled)
    }
}

/// Supervisor view of one report task
#[derive(Debug, Clone, Serialize)]
pub struct ReportTask {
    pub task_id: String,
    pub query: String,
    pub status: TaskStatus,
    /// 0..=100
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ir_path: Option<String>,
    /// Cooperative cancellation flag shared with the pipeline.
    #[serde(skip)]
    pub cancel: Arc<AtomicBool>,
}

impl ReportTask {
    fn new(query: String) -> Self {
        let now = Utc::now();
        Self {
            task_id: format!("task-{}", &Uuid::new_v4().simple().to_string()[..12]),
            query,
            status: TaskStatus::Pending,
            progress: 0,
            message: String::new(),
            error: None,
            created_at: now,
            updated_at: now,
            html_path: None,
            ir_path: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a report task is already in flight: {0}")]
    Busy(String),
}

/// Bounded in-memory task registry
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, ReportTask>>,
    capacity: usize,
}

impl TaskRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Create a new pending task. Fails while another task is still in
    /// flight (single-flight policy).
    pub fn create(&self, query: String) -> Result<ReportTask, RegistryError> {
        let mut tasks = self.tasks.lock().expect("registry lock");
        if let Some(active) = tasks.values().find(|t| !t.status.is_terminal()) {
            return Err(RegistryError::Busy(active.task_id.clone()));
        }

        let task = ReportTask::new(query);
        info!(task_id = %task.task_id, "task created");
        tasks.insert(task.task_id.clone(), task.clone());
        Self::evict_overflow(&mut tasks, self.capacity);
        Ok(task)
    }

    /// Retain the most recent `capacity` tasks by creation time. Terminal
    /// tasks stay queryable until evicted; non-terminal tasks are never
    /// dropped.
    fn evict_overflow(tasks: &mut HashMap<String, ReportTask>, capacity: usize) {
        if tasks.len() <= capacity {
            return;
        }
        let mut terminal: Vec<(String, DateTime<Utc>)> = tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| (t.task_id.clone(), t.created_at))
            .collect();
        terminal.sort_by_key(|(_, created)| *created);
        let excess = tasks.len().saturating_sub(capacity);
        for (task_id, _) in terminal.into_iter().take(excess) {
            debug!(%task_id, "evicting terminal task");
            tasks.remove(&task_id);
        }
    }

    pub fn get(&self, task_id: &str) -> Option<ReportTask> {
        self.tasks.lock().expect("registry lock").get(task_id).cloned()
    }

    /// Apply a mutation to a task, bumping `updated_at`.
    pub fn update<F>(&self, task_id: &str, mutate: F) -> Option<ReportTask>
    where
        F: FnOnce(&mut ReportTask),
    {
        let mut tasks = self.tasks.lock().expect("registry lock");
        let task = tasks.get_mut(task_id)?;
        mutate(task);
        task.updated_at = Utc::now();
        Some(task.clone())
    }

    pub fn set_status(&self, task_id: &str, status: TaskStatus) -> Option<ReportTask> {
        self.update(task_id, |task| {
            task.status = status;
            if status == TaskStatus::Completed {
                task.progress = 100;
            }
        })
    }

    /// The task currently in flight, if any.
    pub fn active(&self) -> Option<ReportTask> {
        self.tasks
            .lock()
            .expect("registry lock")
            .values()
            .find(|t| !t.status.is_terminal())
            .cloned()
    }

    /// The most recently created task, for status summaries.
    pub fn latest(&self) -> Option<ReportTask> {
        self.tasks
            .lock()
            .expect("registry lock")
            .values()
            .max_by_key(|t| t.created_at)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
