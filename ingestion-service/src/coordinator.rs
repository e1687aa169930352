//! Upload ingestion coordinator.
//!
//! Turns uploads into tasks on the [`TaskManager`], drives the progress
//! protocol while they run, keeps the per-bot file catalog current, merges
//! worker file lists once the queue drains, and owns the temp-file sweep.

mod catalog_update;
mod merge;
mod metadata;
mod processing;
mod types;

pub use metadata::{FILE_NAME_COLUMN, MetadataTable};
pub use types::{
    CatalogVerification, CleanupStatistics, HealthReport, HealthStatus, MergeReport, MergeStatus,
    MetadataInfo, ProcessingStatistics, ServiceHealth, ServicesHealth, UploadInfo, UploadStatus,
    WorkerFileListStats,
};

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::catalog::{WorkerFileList, WorkerFileStore, is_reserved_name};
use crate::cleanup::CleanupManager;
use crate::collaborators::{BlobStore, ContentIndexer};
use crate::config::AppConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::notify::{NotificationSender, StatusUpdate};
use crate::tasks::{CompletionHook, NewTask, Task, TaskManager, TaskMetadata};
use processing::UploadJob;

/// External services the coordinator drives
pub struct Collaborators {
    pub indexer: Option<Arc<dyn ContentIndexer>>,
    pub blob_store: Option<Arc<dyn BlobStore>>,
    pub notifications: NotificationSender,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Orchestrates upload processing on top of a [`TaskManager`].
///
/// Lock order: merge flag, then worker lists, then catalog.
pub struct IngestionCoordinator {
    config: AppConfig,
    tasks: Arc<TaskManager>,
    indexer: Option<Arc<dyn ContentIndexer>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    notifications: NotificationSender,
    worker_store: WorkerFileStore,
    /// Worker file lists keyed by list name
    worker_lists: Mutex<HashMap<String, WorkerFileList>>,
    /// Serializes canonical catalog read-modify-write cycles
    catalog_lock: Mutex<()>,
    merge_in_progress: Mutex<bool>,
    metadata: RwLock<Option<MetadataTable>>,
    cleanup: CleanupManager,
}

impl IngestionCoordinator {
    /// Build the coordinator and start its worker pool.
    ///
    /// The cleanup sweep only runs after [`start`](Self::start).
    pub fn new(config: AppConfig, collaborators: Collaborators) -> ServiceResult<Arc<Self>> {
        let worker_store = WorkerFileStore::open(config.worker_lists_dir()).map_err(|e| {
            ServiceError::Initialization {
                message: format!("Cannot open worker file list store: {}", e),
            }
        })?;

        // The hook fires on worker threads, so it reaches the coordinator weakly
        let owner: Arc<OnceLock<Weak<Self>>> = Arc::new(OnceLock::new());
        let hook_owner = owner.clone();
        let hook: CompletionHook = Arc::new(move |task: &Task| {
            if let Some(coordinator) = hook_owner.get().and_then(Weak::upgrade) {
                coordinator.on_task_finished(task);
            }
        });
        let tasks = Arc::new(TaskManager::with_completion_hook(
            config.processing.max_workers,
            hook,
        )?);

        let protected_source = tasks.clone();
        let cleanup = CleanupManager::new(
            config.storage.temp_dir.clone(),
            &config.cleanup,
            Arc::new(move || protected_source.active_file_paths()),
        );

        if collaborators.indexer.is_none() {
            warn!("No content indexer configured; uploads will be rejected");
        }
        if collaborators.blob_store.is_none() {
            warn!("No blob store configured; uploads and merges will be rejected");
        }

        let coordinator = Arc::new(Self {
            config,
            tasks,
            indexer: collaborators.indexer,
            blob_store: collaborators.blob_store,
            notifications: collaborators.notifications,
            worker_store,
            worker_lists: Mutex::new(HashMap::new()),
            catalog_lock: Mutex::new(()),
            merge_in_progress: Mutex::new(false),
            metadata: RwLock::new(None),
            cleanup,
        });
        let _ = owner.set(Arc::downgrade(&coordinator));

        info!(
            workers = coordinator.config.processing.max_workers,
            temp_dir = %coordinator.config.storage.temp_dir.display(),
            "Ingestion coordinator initialized"
        );
        Ok(coordinator)
    }

    /// Start the temp-file sweep
    pub fn start(&self) -> ServiceResult<()> {
        self.cleanup.start()
    }

    /// Stop the sweep, then drain and stop the worker pool.
    ///
    /// Returns true when every worker exited within the shutdown timeout.
    pub fn stop(&self) -> bool {
        info!("Stopping ingestion coordinator");
        self.cleanup.stop();
        self.tasks
            .shutdown(true, Some(self.config.processing.shutdown_timeout()))
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Submit an upload staged at `file_path` and return its work id.
    ///
    /// Returns immediately; processing happens on a worker thread.
    pub fn create_upload_record(
        self: &Arc<Self>,
        filename: &str,
        file_path: impl Into<PathBuf>,
        file_size: u64,
        bot_id: Option<&str>,
    ) -> ServiceResult<String> {
        if self.indexer.is_none() {
            return Err(ServiceError::Initialization {
                message: "Content indexer is not available".to_string(),
            });
        }
        if self.blob_store.is_none() {
            return Err(ServiceError::Initialization {
                message: "Blob store is not available".to_string(),
            });
        }
        if filename.trim().is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "filename must not be empty".to_string(),
            });
        }
        if is_reserved_name(filename) {
            return Err(ServiceError::InvalidRequest {
                message: format!("{} collides with a file catalog name", filename),
            });
        }

        let work_id = uuid::Uuid::new_v4().to_string();
        let bot_id = bot_id
            .filter(|b| !b.trim().is_empty())
            .unwrap_or(&self.config.processing.default_bot_id)
            .to_string();
        let job = UploadJob {
            work_id: work_id.clone(),
            filename: filename.to_string(),
            file_path: file_path.into(),
            file_size,
            bot_id: bot_id.clone(),
        };

        let metadata = TaskMetadata {
            current_message: Some("Queued for processing".to_string()),
            bot_id: Some(bot_id.clone()),
            ..TaskMetadata::default()
        };
        let new_task = NewTask::new(format!("Process upload {}", filename))
            .upload(&work_id, filename, job.file_path.clone(), file_size)
            .metadata(metadata.clone());

        // Announced before submission so it precedes every worker update
        self.notifications.notify(StatusUpdate {
            work_id: work_id.clone(),
            status: UploadStatus::Queued,
            progress_percentage: 0,
            message: metadata.current_message.clone(),
            original_filename: Some(filename.to_string()),
            error_message: None,
            timestamp: Utc::now(),
        });

        let weak = Arc::downgrade(self);
        self.tasks.add_task(
            new_task,
            Box::new(move |context| match weak.upgrade() {
                Some(coordinator) => coordinator.process_upload(context, &job),
                None => Err(crate::error::TaskError::failed(
                    "Ingestion coordinator is no longer running",
                )),
            }),
        )?;

        info!(
            work_id = %work_id,
            filename = %filename,
            file_size = file_size,
            bot_id = %bot_id,
            "Upload queued"
        );
        Ok(work_id)
    }

    pub fn get_upload_info(&self, work_id: &str) -> ServiceResult<UploadInfo> {
        self.tasks
            .get_task_by_work_id(work_id)
            .as_ref()
            .and_then(UploadInfo::from_task)
            .ok_or_else(|| ServiceError::UploadNotFound {
                work_id: work_id.to_string(),
            })
    }

    pub fn get_uploads_by_status(&self, status: UploadStatus) -> Vec<UploadInfo> {
        let tasks = match status {
            UploadStatus::Queued => self.tasks.get_pending_tasks(),
            UploadStatus::Processing => self.tasks.get_in_progress_tasks(),
            UploadStatus::Completed => self.tasks.get_done_tasks(),
            UploadStatus::Failed => self.tasks.get_failed_tasks(),
        };
        tasks.iter().filter_map(UploadInfo::from_task).collect()
    }

    pub fn get_processing_statistics(&self) -> ProcessingStatistics {
        let snapshot = self.tasks.snapshot();
        let count = |tasks: &[Task]| tasks.iter().filter(|t| t.work_id.is_some()).count();
        let queued = count(&snapshot.pending);
        let processing = count(&snapshot.in_progress);
        let completed = count(&snapshot.done);
        let failed = count(&snapshot.failed);
        let total = queued + processing + completed + failed;

        let overall_progress = if total == 0 {
            100.0
        } else {
            (completed + failed) as f64 / total as f64 * 100.0
        };

        ProcessingStatistics {
            total,
            queued,
            processing,
            completed,
            failed,
            overall_progress,
            worker_stats: snapshot.statistics,
        }
    }

    pub fn check_service_health(&self) -> HealthReport {
        let stats = self.tasks.get_statistics();
        let mut task_manager = if self.tasks.is_shut_down() {
            ServiceHealth::unhealthy("Task manager is shut down")
        } else if stats.active_workers == 0 {
            ServiceHealth::unhealthy("No task workers are running")
        } else if stats.active_workers < stats.workers {
            ServiceHealth {
                status: HealthStatus::Degraded,
                message: format!("{} of {} workers running", stats.active_workers, stats.workers),
                details: None,
            }
        } else {
            ServiceHealth::healthy("Task manager running")
        };
        task_manager.details = Some(serde_json::json!({
            "workers": stats.workers,
            "active_workers": stats.active_workers,
            "pending": stats.pending,
            "in_progress": stats.in_progress,
        }));

        let indexer = match &self.indexer {
            None => ServiceHealth::unhealthy("Content indexer not configured"),
            Some(indexer) => match indexer.check_ready() {
                Ok(()) => ServiceHealth::healthy(format!("{} indexer ready", indexer.name())),
                Err(e) => ServiceHealth::unhealthy(e.to_string()),
            },
        };

        let blob_store = match &self.blob_store {
            None => ServiceHealth::unhealthy("Blob store not configured"),
            Some(store) => match store.check_health() {
                Ok(()) => ServiceHealth::healthy(format!("{} blob store reachable", store.name())),
                Err(e) => ServiceHealth::unhealthy(e.to_string()),
            },
        };

        let statuses = [task_manager.status, indexer.status, blob_store.status];
        let (status, message) = if statuses.contains(&HealthStatus::Unhealthy) {
            (HealthStatus::Unhealthy, "One or more services are unavailable")
        } else if statuses.contains(&HealthStatus::Degraded) {
            (HealthStatus::Degraded, "Some services are degraded")
        } else {
            (HealthStatus::Healthy, "All services operational")
        };

        HealthReport {
            status,
            message: message.to_string(),
            services: ServicesHealth {
                task_manager,
                indexer,
                blob_store,
            },
        }
    }

    /// Summary of the in-memory worker file lists, keyed by worker id
    pub fn get_worker_file_list_stats(&self) -> WorkerFileListStats {
        lock(&self.worker_lists)
            .values()
            .map(|list| {
                (
                    list.worker_id.clone(),
                    crate::catalog::WorkerListStats {
                        file_count: list.files.len(),
                        created_at: list.created_at.clone(),
                        updated_at: list.updated_at.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn cleanup_statistics(&self) -> CleanupStatistics {
        let snapshot = self.cleanup.snapshot();
        CleanupStatistics {
            running: self.cleanup.is_running(),
            interval_secs: self.cleanup.interval().as_secs(),
            file_age_threshold_secs: self.cleanup.file_age_threshold().as_secs(),
            temp_dir: self.cleanup.temp_dir().to_path_buf(),
            total_temp_files: snapshot.total,
            protected_files: snapshot.protected,
            cleanable_files: snapshot.cleanable,
        }
    }

    /// Run one temp-file sweep immediately
    pub fn run_cleanup(&self) -> ServiceResult<crate::cleanup::SweepReport> {
        self.cleanup.perform_scan()
    }

    /// Forget finished uploads older than `days`. Returns how many were dropped.
    pub fn prune_old_uploads(&self, days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let removed = self.tasks.prune_finished_before(cutoff);
        if removed > 0 {
            info!(removed = removed, days = days, "Pruned finished uploads");
        }
        removed
    }

    /// Compare the canonical catalog with the uploads finished for `bot_id`
    pub fn verify_catalog(&self, bot_id: &str) -> ServiceResult<CatalogVerification> {
        let catalog = self.get_catalog(bot_id)?;
        let catalog_names: BTreeSet<String> = catalog
            .map(|c| c.file_names().into_iter().collect())
            .unwrap_or_default();

        let processed: BTreeSet<String> = self
            .tasks
            .get_done_tasks()
            .into_iter()
            .chain(self.tasks.get_failed_tasks())
            .filter(|t| t.work_id.is_some())
            .filter(|t| t.metadata.bot_id.as_deref() == Some(bot_id))
            .filter_map(|t| t.original_filename)
            .collect();

        let missing_from_catalog: Vec<String> =
            processed.difference(&catalog_names).cloned().collect();
        let untracked_in_catalog: Vec<String> =
            catalog_names.difference(&processed).cloned().collect();

        if !missing_from_catalog.is_empty() {
            warn!(
                bot_id = %bot_id,
                missing = missing_from_catalog.len(),
                "Finished uploads missing from catalog"
            );
        }

        Ok(CatalogVerification {
            bot_id: bot_id.to_string(),
            catalog_files: catalog_names.len(),
            processed_uploads: processed.len(),
            consistent: missing_from_catalog.is_empty(),
            missing_from_catalog,
            untracked_in_catalog,
        })
    }

    /// Push the task's current state to subscribers
    fn notify_task(&self, task: &Task) {
        let Some(work_id) = task.work_id.clone() else {
            return;
        };
        self.notifications.notify(StatusUpdate {
            work_id,
            status: UploadStatus::of_task(task),
            progress_percentage: task.progress_percentage,
            message: task.metadata.current_message.clone(),
            original_filename: task.original_filename.clone(),
            error_message: task.error.clone(),
            timestamp: Utc::now(),
        });
    }

    /// Completion hook: merge once the queue drains, then announce the final state
    fn on_task_finished(&self, task: &Task) {
        if task.work_id.is_none() {
            return;
        }

        if self.tasks.get_statistics().is_idle() {
            let bot_id = task
                .metadata
                .bot_id
                .clone()
                .unwrap_or_else(|| self.config.processing.default_bot_id.clone());
            debug!(
                bot_id = %bot_id,
                status = task.status.as_str(),
                "Queue drained, merging worker file lists"
            );
            self.try_auto_merge(&bot_id);
        }

        self.notify_task(task);
    }

    fn read_metadata(&self) -> RwLockReadGuard<'_, Option<MetadataTable>> {
        self.metadata.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metadata(&self) -> RwLockWriteGuard<'_, Option<MetadataTable>> {
        self.metadata.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_blob_store(&self) -> ServiceResult<&Arc<dyn BlobStore>> {
        self.blob_store
            .as_ref()
            .ok_or_else(|| ServiceError::Initialization {
                message: "Blob store is not available".to_string(),
            })
    }
}

#[cfg(test)]
pub(crate) mod test_support;
