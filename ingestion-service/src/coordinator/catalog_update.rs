//! Canonical catalog and worker file list persistence.

use std::collections::hash_map::Entry;

use tracing::{debug, warn};

use super::{IngestionCoordinator, lock};
use crate::catalog::{FileEntry, MergedFileList, WorkerFileList, catalog_name, worker_list_name};
use crate::collaborators::BlobStore;
use crate::error::{ServiceError, ServiceResult, StorageError};

/// Read a bot's canonical catalog, `None` if it was never written
pub(super) fn load_catalog(
    store: &dyn BlobStore,
    bot_id: &str,
) -> Result<Option<MergedFileList>, StorageError> {
    match store.download_bytes(&catalog_name(bot_id)) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(StorageError::Serialization),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub(super) fn save_catalog(
    store: &dyn BlobStore,
    catalog: &MergedFileList,
) -> Result<(), StorageError> {
    let json = serde_json::to_vec_pretty(catalog).map_err(StorageError::Serialization)?;
    store.upload_bytes(&catalog_name(&catalog.bot_id), &json)
}

impl IngestionCoordinator {
    /// Current canonical catalog for `bot_id`
    pub fn get_catalog(&self, bot_id: &str) -> ServiceResult<Option<MergedFileList>> {
        let store = self.require_blob_store()?;
        Ok(load_catalog(store.as_ref(), bot_id)?)
    }

    /// Upsert one entry into the canonical catalog.
    ///
    /// The catalog lock is held across the read-modify-write cycle.
    pub(super) fn update_catalog_entry(
        &self,
        bot_id: &str,
        entry: FileEntry,
    ) -> ServiceResult<()> {
        let store = self.require_blob_store()?;
        let filename = entry.name.clone();
        let failed = |source: StorageError| ServiceError::CatalogUpdate {
            filename: filename.clone(),
            source,
        };

        let _guard = lock(&self.catalog_lock);
        let mut catalog = load_catalog(store.as_ref(), bot_id)
            .map_err(failed)?
            .unwrap_or_else(|| MergedFileList::empty(bot_id));
        catalog.upsert(entry);
        save_catalog(store.as_ref(), &catalog).map_err(failed)?;

        debug!(
            bot_id = %bot_id,
            filename = %filename,
            total_files = catalog.total_files,
            "Catalog entry updated"
        );
        Ok(())
    }

    /// Append an entry to this worker's file list and persist it
    pub(super) fn record_worker_file(
        &self,
        worker_id: &str,
        bot_id: &str,
        entry: FileEntry,
    ) -> ServiceResult<()> {
        let name = worker_list_name(bot_id, worker_id);
        let mut cache = lock(&self.worker_lists);

        let list = match cache.entry(name.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                // Pick up a list left behind by an earlier run
                let existing = self.worker_store.load(&name).unwrap_or_else(|e| {
                    warn!(name = %name, error = %e, "Replacing unreadable worker file list");
                    None
                });
                vacant.insert(existing.unwrap_or_else(|| WorkerFileList::new(worker_id)))
            }
        };

        list.record(entry);
        self.worker_store.save(&name, list)?;
        Ok(())
    }
}
