//! Task value types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Progress value recorded when a task fails.
pub const PROGRESS_FAILED: i32 = -1;

/// Priority levels, ordered lowest to highest
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "LOW",
            TaskPriority::Normal => "NORMAL",
            TaskPriority::High => "HIGH",
            TaskPriority::Critical => "CRITICAL",
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Transitions only move forward one step: pending -> in_progress -> done | failed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Done)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        )
    }
}

/// Task metadata: known keys plus an open extension map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Latest human-readable progress message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_message: Option<String>,

    /// Bot whose catalog this task contributes to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TaskMetadata {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            current_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Overlay `update` onto `self`. Unset known keys leave the current value alone.
    pub fn merge(&mut self, update: TaskMetadata) {
        if update.current_message.is_some() {
            self.current_message = update.current_message;
        }
        if update.bot_id.is_some() {
            self.bot_id = update.bot_id;
        }
        self.extra.extend(update.extra);
    }
}

/// One unit of schedulable work
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// External correlation id for an upload
    pub work_id: Option<String>,
    pub original_filename: Option<String>,
    pub file_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    /// 0-100, or `PROGRESS_FAILED`
    pub progress_percentage: i32,
    pub error: Option<String>,
    pub metadata: TaskMetadata,
    pub worker_id: Option<String>,
}

impl Task {
    pub(crate) fn from_new(id: String, new: NewTask) -> Self {
        Self {
            id,
            description: new.description,
            priority: new.priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            work_id: new.work_id,
            original_filename: new.original_filename,
            file_path: new.file_path,
            file_size: new.file_size,
            progress_percentage: 0,
            error: None,
            metadata: new.metadata,
            worker_id: None,
        }
    }

    /// Execution time in seconds, once the task has finished
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    pub(crate) fn mark_started(&mut self, worker_id: &str) {
        debug_assert!(self.status.can_transition_to(TaskStatus::InProgress));
        self.status = TaskStatus::InProgress;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_done(&mut self) {
        debug_assert!(self.status.can_transition_to(TaskStatus::Done));
        self.status = TaskStatus::Done;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, message: String) {
        debug_assert!(self.status.can_transition_to(TaskStatus::Failed));
        self.status = TaskStatus::Failed;
        self.error = Some(message);
        self.completed_at = Some(Utc::now());
    }

    /// Apply a progress report. Returns whether the stored value changed.
    ///
    /// Values are clamped to 0..=100 and never move backwards. The failure
    /// sentinel is accepted at any time and is final.
    pub(crate) fn apply_progress(&mut self, percentage: i32) -> bool {
        if self.progress_percentage == PROGRESS_FAILED {
            return false;
        }
        if percentage < 0 {
            self.progress_percentage = PROGRESS_FAILED;
            return true;
        }
        let clamped = percentage.min(100);
        if clamped > self.progress_percentage {
            self.progress_percentage = clamped;
            true
        } else {
            false
        }
    }
}

/// Submission parameters for a new task
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub description: String,
    pub priority: TaskPriority,
    pub work_id: Option<String>,
    pub original_filename: Option<String>,
    pub file_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub metadata: TaskMetadata,
}

impl NewTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn upload(
        mut self,
        work_id: impl Into<String>,
        original_filename: impl Into<String>,
        file_path: impl Into<PathBuf>,
        file_size: u64,
    ) -> Self {
        self.work_id = Some(work_id.into());
        self.original_filename = Some(original_filename.into());
        self.file_path = Some(file_path.into());
        self.file_size = Some(file_size);
        self
    }

    pub fn metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Identity handed to a task function while it runs
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub work_id: Option<String>,
    pub worker_id: String,
}

/// A task body. Arguments are captured by the closure.
pub type TaskFn = Box<dyn FnOnce(&TaskContext) -> Result<(), TaskError> + Send + 'static>;

/// Queue and counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStatistics {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub total_added: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub workers: usize,
    pub active_workers: usize,
}

impl TaskStatistics {
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

/// Every task grouped by state, taken under one lock
#[derive(Debug, Clone, Default)]
pub struct TaskSnapshot {
    pub pending: Vec<Task>,
    pub in_progress: Vec<Task>,
    pub done: Vec<Task>,
    pub failed: Vec<Task>,
    pub statistics: TaskStatistics,
}
