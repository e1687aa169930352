//! Folding worker file lists into the canonical catalog.

use std::collections::{BTreeMap, HashMap};

use tracing::{error, info, warn};

use super::catalog_update::{load_catalog, save_catalog};
use super::types::{MergeReport, MergeStatus};
use super::{IngestionCoordinator, lock};
use crate::catalog::{
    FileEntry, MERGE_UPDATED_BY, MergeInfo, MergedFileList, WorkerFileList, WorkerListStats,
    dedupe_latest, timestamp_now, worker_list_prefix,
};
use crate::error::{ServiceError, ServiceResult, StorageError, format_error_chain};

/// Clears the merge flag however the merge ends
struct MergeFlag<'a>(&'a std::sync::Mutex<bool>);

impl Drop for MergeFlag<'_> {
    fn drop(&mut self) {
        *lock(self.0) = false;
    }
}

impl MergeReport {
    fn success(
        bot_id: &str,
        total_workers: usize,
        total_files: usize,
        duplicates_removed: usize,
        merged_at: String,
    ) -> Self {
        Self {
            status: MergeStatus::Success,
            bot_id: bot_id.to_string(),
            total_workers,
            total_files,
            duplicates_removed,
            merged_at,
            error: None,
        }
    }

    fn failed(bot_id: &str, total_workers: usize, error: &ServiceError) -> Self {
        Self {
            status: MergeStatus::Error,
            bot_id: bot_id.to_string(),
            total_workers,
            total_files: 0,
            duplicates_removed: 0,
            merged_at: timestamp_now(),
            error: Some(format_error_chain(error)),
        }
    }
}

/// Worker entries first (deduplicated), then existing catalog entries that
/// are missing or strictly newer.
fn combine(worker_entries: Vec<FileEntry>, existing: Option<MergedFileList>) -> Vec<FileEntry> {
    let mut files = worker_entries;
    let mut positions: HashMap<String, usize> = files
        .iter()
        .enumerate()
        .map(|(i, f)| (f.key().to_string(), i))
        .collect();

    for entry in existing.map(|c| c.files).unwrap_or_default() {
        let key = entry.key().to_string();
        match positions.get(&key) {
            Some(&i) => {
                if entry.processed_at > files[i].processed_at {
                    files[i] = entry;
                }
            }
            None => {
                positions.insert(key, files.len());
                files.push(entry);
            }
        }
    }
    files
}

impl IngestionCoordinator {
    /// Merge every worker file list for `bot_id` into the canonical catalog.
    ///
    /// Storage failures are reported in the returned status; only a missing
    /// blob store is an error.
    pub fn merge_worker_file_lists(&self, bot_id: &str) -> ServiceResult<MergeReport> {
        let store = self.require_blob_store()?;
        let mut cache = lock(&self.worker_lists);

        let merge_failed = |source: StorageError, workers: usize| {
            let e = ServiceError::Merge {
                bot_id: bot_id.to_string(),
                source,
            };
            error!(error = %format_error_chain(&e), "Merge failed");
            MergeReport::failed(bot_id, workers, &e)
        };

        let names = match self.worker_store.list(bot_id) {
            Ok(names) => names,
            Err(source) => return Ok(merge_failed(source, 0)),
        };

        let mut lists: Vec<(String, WorkerFileList)> = Vec::with_capacity(names.len());
        for name in names {
            match self.worker_store.load(&name) {
                Ok(Some(list)) => lists.push((name, list)),
                Ok(None) => {}
                Err(e) => warn!(name = %name, error = %e, "Skipping unreadable worker file list"),
            }
        }

        let _catalog_guard = lock(&self.catalog_lock);
        let existing = match load_catalog(store.as_ref(), bot_id) {
            Ok(existing) => existing,
            Err(source) => return Ok(merge_failed(source, lists.len())),
        };

        if lists.is_empty() {
            let total_files = existing.map_or(0, |c| c.files.len());
            info!(bot_id = %bot_id, total_files = total_files, "No worker file lists to merge");
            return Ok(MergeReport::success(bot_id, 0, total_files, 0, timestamp_now()));
        }

        let worker_stats: BTreeMap<String, WorkerListStats> = lists
            .iter()
            .map(|(_, list)| {
                (
                    list.worker_id.clone(),
                    WorkerListStats {
                        file_count: list.files.len(),
                        created_at: list.created_at.clone(),
                        updated_at: list.updated_at.clone(),
                    },
                )
            })
            .collect();

        let all_entries: Vec<FileEntry> = lists
            .iter()
            .flat_map(|(_, list)| list.files.iter().cloned())
            .collect();
        let total_entries = all_entries.len();
        let unique = dedupe_latest(all_entries);
        let duplicates_removed = total_entries - unique.len();
        let unique_files = unique.len();

        let files = combine(unique, existing);
        let merged_at = timestamp_now();
        let catalog = MergedFileList {
            bot_id: bot_id.to_string(),
            updated_at: merged_at.clone(),
            updated_by: MERGE_UPDATED_BY.to_string(),
            total_files: files.len(),
            files,
            merge_info: Some(MergeInfo {
                merged_at: merged_at.clone(),
                worker_count: lists.len(),
                total_entries_processed: total_entries,
                unique_files,
                duplicates_removed,
                worker_stats,
            }),
        };

        if let Err(source) = save_catalog(store.as_ref(), &catalog) {
            return Ok(merge_failed(source, lists.len()));
        }

        for (name, _) in &lists {
            if let Err(e) = self.worker_store.remove(name) {
                warn!(name = %name, error = %e, "Failed to delete merged worker file list");
            }
        }
        let prefix = worker_list_prefix(bot_id);
        cache.retain(|name, _| !name.starts_with(&prefix));

        info!(
            bot_id = %bot_id,
            workers = lists.len(),
            total_files = catalog.total_files,
            duplicates_removed = duplicates_removed,
            "Merged worker file lists"
        );
        Ok(MergeReport::success(
            bot_id,
            lists.len(),
            catalog.total_files,
            duplicates_removed,
            merged_at,
        ))
    }

    /// Merge unless another merge is already running
    pub(super) fn try_auto_merge(&self, bot_id: &str) {
        {
            let mut in_progress = lock(&self.merge_in_progress);
            if *in_progress {
                info!(bot_id = %bot_id, "Merge already in progress, skipping");
                return;
            }
            *in_progress = true;
        }
        let _flag = MergeFlag(&self.merge_in_progress);

        match self.merge_worker_file_lists(bot_id) {
            Ok(report) if report.status == MergeStatus::Success => {}
            Ok(report) => warn!(
                bot_id = %bot_id,
                error = report.error.as_deref().unwrap_or_default(),
                "Automatic merge reported an error"
            ),
            Err(e) => error!(bot_id = %bot_id, error = %format_error_chain(&e), "Automatic merge failed"),
        }
    }
}
