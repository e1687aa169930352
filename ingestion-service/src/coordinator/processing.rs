//! Task body for one upload and its progress protocol.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::IngestionCoordinator;
use crate::catalog::{EntryStatus, FileEntry, MetadataRow};
use crate::collaborators::{BlobStore, ContentIndexer};
use crate::error::{IndexerError, ServiceError, ServiceResult, TaskError, format_error_chain};
use crate::tasks::{PROGRESS_FAILED, TaskContext, TaskMetadata, panic_message};

/// Start of the band the indexer's own 0-100 progress is mapped into
const INDEX_BAND_START: i32 = 40;

/// Width of that band
const INDEX_BAND_WIDTH: i32 = 50;

/// Word formats whose presence makes a same-named PDF redundant
const WORD_EXTENSIONS: [&str; 2] = ["docx", "doc"];

/// Arguments captured by an upload task
#[derive(Debug, Clone)]
pub(super) struct UploadJob {
    pub work_id: String,
    pub filename: String,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub bot_id: String,
}

/// Map indexer progress (0-100) into the content-processing band
pub(super) fn map_indexer_progress(percentage: i32) -> i32 {
    INDEX_BAND_START + percentage.clamp(0, 100) * INDEX_BAND_WIDTH / 100
}

impl IngestionCoordinator {
    /// Run one upload. Failures are reported at -1 and recorded in the catalog.
    pub(super) fn process_upload(
        &self,
        ctx: &TaskContext,
        job: &UploadJob,
    ) -> Result<(), TaskError> {
        info!(
            work_id = %job.work_id,
            worker_id = %ctx.worker_id,
            filename = %job.filename,
            "Processing upload"
        );

        // A panicking collaborator takes the same failure path as a returned error
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_upload(ctx, job)))
            .unwrap_or_else(|payload| {
                Err(ServiceError::TaskExecution {
                    message: format!("Task panicked: {}", panic_message(payload.as_ref())),
                })
            });

        if let Err(e) = &result {
            let message = format!("Error processing file: {}", format_error_chain(e));
            error!(work_id = %job.work_id, error = %message, "Upload processing failed");
            self.report(ctx, PROGRESS_FAILED, &message);

            let entry = self.catalog_entry(job, EntryStatus::Failed, None);
            if let Err(e) = self.update_catalog_entry(&job.bot_id, entry) {
                warn!(
                    work_id = %job.work_id,
                    error = %format_error_chain(&e),
                    "Catalog update failed"
                );
            }
        }

        self.remove_temp_file(job);
        result.map_err(TaskError::from)
    }

    fn run_upload(&self, ctx: &TaskContext, job: &UploadJob) -> ServiceResult<()> {
        let (indexer, store) = self.collaborators()?;

        self.report(ctx, 10, "Starting file processing");

        self.report(ctx, 15, "Checking backend services");
        indexer.check_ready()?;
        self.report(ctx, 20, "Backend services ready");

        self.report(ctx, 30, "Preparing file for processing");
        if !job.file_path.is_file() {
            return Err(ServiceError::TaskExecution {
                message: format!("Staged file {} is missing", job.file_path.display()),
            });
        }

        self.report(ctx, 35, "Looking up file metadata");
        let metadata = self.resolve_metadata(&job.filename)?;
        if metadata.is_some() {
            debug!(work_id = %job.work_id, "Metadata attached to upload");
        }

        match self.find_word_original(store.as_ref(), &job.filename) {
            Some(original) => {
                publish_unindexed(store.as_ref(), &job.file_path, &job.filename)?;
                info!(
                    work_id = %job.work_id,
                    original = %original,
                    "Skipped indexing PDF with a Word original"
                );
                self.report(
                    ctx,
                    95,
                    &format!("Skipped indexing: Word original {} already processed", original),
                );
            }
            None => {
                self.report(ctx, INDEX_BAND_START, "Starting file content extraction");
                self.index(ctx, indexer.as_ref(), job, metadata.as_ref())?;
                self.report(ctx, 95, "Finalizing");
            }
        }

        let entry = self.catalog_entry(job, EntryStatus::Completed, metadata);
        if let Err(e) = self.record_worker_file(&ctx.worker_id, &job.bot_id, entry.clone()) {
            warn!(
                work_id = %job.work_id,
                error = %format_error_chain(&e),
                "Failed to record worker file list entry"
            );
        }

        self.report(ctx, 97, "Updating file list");
        if let Err(e) = self.update_catalog_entry(&job.bot_id, entry) {
            // The file itself is processed; only the catalog is stale
            warn!(work_id = %job.work_id, error = %format_error_chain(&e), "Catalog update failed");
        }

        self.report(ctx, 100, "Processing completed");
        Ok(())
    }

    fn index(
        &self,
        ctx: &TaskContext,
        indexer: &dyn ContentIndexer,
        job: &UploadJob,
        metadata: Option<&MetadataRow>,
    ) -> ServiceResult<()> {
        let progress = |percentage: i32, message: &str| {
            self.report(ctx, map_indexer_progress(percentage), message);
        };

        let processed = indexer.process(&job.file_path, &job.filename, metadata, &progress)?;
        if !processed {
            return Err(IndexerError::Rejected {
                filename: job.filename.clone(),
                message: format!("{} indexer produced no content", indexer.name()),
            }
            .into());
        }
        Ok(())
    }

    /// Record progress and a message on the task, then notify subscribers
    pub(super) fn report(&self, ctx: &TaskContext, percentage: i32, message: &str) {
        self.tasks.update_task_progress(&ctx.task_id, percentage);
        self.tasks
            .update_task_metadata(&ctx.task_id, TaskMetadata::with_message(message));

        debug!(task_id = %ctx.task_id, progress = percentage, message = %message, "Progress");
        if let Some(task) = self.tasks.get_task(&ctx.task_id) {
            self.notify_task(&task);
        }
    }

    fn collaborators(&self) -> ServiceResult<(&Arc<dyn ContentIndexer>, &Arc<dyn BlobStore>)> {
        let indexer = self
            .indexer
            .as_ref()
            .ok_or_else(|| ServiceError::Initialization {
                message: "Content indexer is not available".to_string(),
            })?;
        Ok((indexer, self.require_blob_store()?))
    }

    fn catalog_entry(
        &self,
        job: &UploadJob,
        status: EntryStatus,
        metadata: Option<MetadataRow>,
    ) -> FileEntry {
        let uri = self
            .blob_store
            .as_ref()
            .map(|store| store.uri_for(&job.filename))
            .unwrap_or_default();
        FileEntry::new(&job.filename, job.file_size, uri, status).with_metadata(metadata)
    }

    /// Name of a stored Word document sharing the PDF's stem, if skipping is enabled
    fn find_word_original(&self, store: &dyn BlobStore, filename: &str) -> Option<String> {
        if !self.config.processing.skip_pdf_with_word_original {
            return None;
        }
        let path = Path::new(filename);
        let is_pdf = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
        if !is_pdf {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;

        WORD_EXTENSIONS.iter().find_map(|ext| {
            let candidate = format!("{}.{}", stem, ext);
            match store.blob_exists(&candidate) {
                Ok(true) => Some(candidate),
                Ok(false) => None,
                Err(e) => {
                    warn!(candidate = %candidate, error = %e, "Could not check for Word original");
                    None
                }
            }
        })
    }

    fn remove_temp_file(&self, job: &UploadJob) {
        match std::fs::remove_file(&job.file_path) {
            Ok(()) => debug!(path = %job.file_path.display(), "Removed temp file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %job.file_path.display(),
                error = %e,
                "Failed to remove temp file; the cleanup sweep will retry"
            ),
        }
    }
}

/// Store the upload as-is, bypassing the indexer
fn publish_unindexed(store: &dyn BlobStore, path: &Path, filename: &str) -> ServiceResult<()> {
    let content = std::fs::read(path).map_err(|source| IndexerError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    store.upload_bytes(filename, &content)?;
    Ok(())
}
