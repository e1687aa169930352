//! Durable storage for worker-scoped file lists on the local filesystem.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{WorkerFileList, worker_list_prefix};
use crate::error::StorageError;

/// Directory of `{bot_id}-filelist-worker-{worker_id}.json` documents
#[derive(Debug, Clone)]
pub struct WorkerFileStore {
    dir: PathBuf,
}

impl WorkerFileStore {
    /// Open the store, creating its directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            name: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names of every worker list stored for `bot_id`, sorted
    pub fn list(&self, bot_id: &str) -> Result<Vec<String>, StorageError> {
        let prefix = worker_list_prefix(bot_id);
        let entries = std::fs::read_dir(&self.dir).map_err(|source| StorageError::Io {
            name: self.dir.display().to_string(),
            source,
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .filter(|name| name.starts_with(&prefix) && name.ends_with(".json"))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Load a list, or `None` if it does not exist
    pub fn load(&self, name: &str) -> Result<Option<WorkerFileList>, StorageError> {
        let path = self.dir.join(name);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::Io {
                    name: name.to_string(),
                    source,
                });
            }
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(StorageError::Serialization)
    }

    /// Write a list, replacing any previous version atomically
    pub fn save(&self, name: &str, list: &WorkerFileList) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(list).map_err(StorageError::Serialization)?;
        let tmp_path = self.dir.join(format!(".{}.tmp", name));
        let io_err = |source| StorageError::Io {
            name: name.to_string(),
            source,
        };
        std::fs::write(&tmp_path, json).map_err(io_err)?;
        std::fs::rename(&tmp_path, self.dir.join(name)).map_err(io_err)?;
        debug!(name = %name, files = list.files.len(), "Saved worker file list");
        Ok(())
    }

    /// Delete a list. Returns false if it was already gone.
    pub fn remove(&self, name: &str) -> Result<bool, StorageError> {
        match std::fs::remove_file(self.dir.join(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntryStatus, FileEntry, worker_list_name};
    use tempfile::TempDir;

    #[test]
    fn test_save_load_list_remove() {
        let dir = TempDir::new().unwrap();
        let store = WorkerFileStore::open(dir.path().join("lists")).unwrap();

        let mut list = WorkerFileList::new("task-worker-1");
        list.record(FileEntry::new(
            "a.pdf",
            10,
            "file:///a.pdf".to_string(),
            EntryStatus::Completed,
        ));
        let name = worker_list_name("bot", "task-worker-1");
        store.save(&name, &list).unwrap();
        store
            .save(&worker_list_name("other", "task-worker-1"), &list)
            .unwrap();

        assert_eq!(store.list("bot").unwrap(), vec![name.clone()]);
        assert_eq!(store.load(&name).unwrap(), Some(list));
        assert!(store.load("missing.json").unwrap().is_none());

        assert!(store.remove(&name).unwrap());
        assert!(!store.remove(&name).unwrap());
        assert!(store.list("bot").unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_list_is_a_serialization_error() {
        let dir = TempDir::new().unwrap();
        let store = WorkerFileStore::open(dir.path()).unwrap();
        let name = worker_list_name("bot", "w");
        std::fs::write(dir.path().join(&name), b"not json").unwrap();

        assert!(matches!(
            store.load(&name),
            Err(StorageError::Serialization(_))
        ));
    }
}
