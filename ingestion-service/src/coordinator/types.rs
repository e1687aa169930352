//! Public result types returned by the coordinator.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::WorkerListStats;
use crate::tasks::{PROGRESS_FAILED, Task, TaskMetadata, TaskStatistics, TaskStatus};

/// Upload status in the public vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    /// Public status of a task; the -1 sentinel reads as failed before the task settles
    pub fn of_task(task: &Task) -> Self {
        if task.progress_percentage == PROGRESS_FAILED {
            UploadStatus::Failed
        } else {
            task.status.into()
        }
    }
}

impl From<TaskStatus> for UploadStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => UploadStatus::Queued,
            TaskStatus::InProgress => UploadStatus::Processing,
            TaskStatus::Done => UploadStatus::Completed,
            TaskStatus::Failed => UploadStatus::Failed,
        }
    }
}

/// Status of one upload as seen by polling clients
#[derive(Debug, Clone, Serialize)]
pub struct UploadInfo {
    pub work_id: String,
    pub status: UploadStatus,
    pub progress_percentage: i32,
    pub original_filename: Option<String>,
    pub file_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_processing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: TaskMetadata,
}

impl UploadInfo {
    /// Returns `None` for tasks that are not uploads
    pub fn from_task(task: &Task) -> Option<Self> {
        Some(Self {
            work_id: task.work_id.clone()?,
            status: UploadStatus::of_task(task),
            progress_percentage: task.progress_percentage,
            original_filename: task.original_filename.clone(),
            file_size: task.file_size,
            created_at: task.created_at,
            started_processing_at: task.started_at,
            completed_at: task.completed_at,
            error_message: task.error.clone(),
            metadata: task.metadata.clone(),
        })
    }
}

/// Aggregate view over upload tasks
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStatistics {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Share of uploads in a terminal state, 0-100
    pub overall_progress: f64,
    pub worker_stats: TaskStatistics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ServiceHealth {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: message.into(),
            details: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServicesHealth {
    pub task_manager: ServiceHealth,
    pub indexer: ServiceHealth,
    pub blob_store: ServiceHealth,
}

/// Structured health of the coordinator and its collaborators
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
    pub services: ServicesHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Success,
    Error,
}

/// Outcome of merging a bot's worker file lists
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub status: MergeStatus,
    pub bot_id: String,
    pub total_workers: usize,
    pub total_files: usize,
    pub duplicates_removed: usize,
    pub merged_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Loaded metadata table summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetadataInfo {
    pub loaded: bool,
    pub rows: usize,
    pub columns: Vec<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Snapshot of the temp-directory sweep
#[derive(Debug, Clone, Serialize)]
pub struct CleanupStatistics {
    pub running: bool,
    pub interval_secs: u64,
    pub file_age_threshold_secs: u64,
    pub temp_dir: PathBuf,
    pub total_temp_files: usize,
    pub protected_files: usize,
    pub cleanable_files: usize,
}

/// Canonical catalog compared with finished uploads
#[derive(Debug, Clone, Serialize)]
pub struct CatalogVerification {
    pub bot_id: String,
    pub catalog_files: usize,
    pub processed_uploads: usize,
    /// Finished uploads with no catalog entry
    pub missing_from_catalog: Vec<String>,
    /// Catalog entries with no finished upload in memory
    pub untracked_in_catalog: Vec<String>,
    pub consistent: bool,
}

/// Per-worker summary of cached worker file lists, keyed by worker id
pub type WorkerFileListStats = BTreeMap<String, WorkerListStats>;
