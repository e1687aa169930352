//! Directory-backed blob store.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info};

use crate::collaborators::BlobStore;
use crate::error::StorageError;

/// Stores each blob as a file directly under `root`.
///
/// Blob names are flat: separators, `..` and leading dots are rejected.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open the store, creating `root` if needed
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref();
        let io_err = |source| StorageError::Io {
            name: root.display().to_string(),
            source,
        };
        std::fs::create_dir_all(root).map_err(io_err)?;
        let root = std::fs::canonicalize(root).map_err(io_err)?;

        info!(root = %root.display(), "Opened local blob store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        let invalid = name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..");
        if invalid {
            return Err(StorageError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(self.root.join(name))
    }
}

impl BlobStore for LocalBlobStore {
    fn upload_bytes(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.blob_path(name)?;
        let tmp_path = self.root.join(format!(".{}.partial", name));
        let io_err = |source| StorageError::Io {
            name: name.to_string(),
            source,
        };

        std::fs::write(&tmp_path, data).map_err(io_err)?;
        std::fs::rename(&tmp_path, &path).map_err(io_err)?;
        debug!(name = %name, bytes = data.len(), "Stored blob");
        Ok(())
    }

    fn download_bytes(&self, name: &str) -> Result<Bytes, StorageError> {
        let path = self.blob_path(name)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                name: name.to_string(),
            }),
            Err(source) => Err(StorageError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn list_blobs(&self) -> Result<Vec<String>, StorageError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| StorageError::Io {
            name: self.root.display().to_string(),
            source,
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        Ok(names)
    }

    fn blob_exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.blob_path(name)?.is_file())
    }

    fn delete_blob(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.blob_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn uri_for(&self, name: &str) -> String {
        format!("file://{}", self.root.join(name).display())
    }

    fn check_health(&self) -> Result<(), StorageError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                message: format!("{} is not a directory", self.root.display()),
            })
        }
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_blob_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::open(dir.path().join("blobs")).unwrap();

        store.upload_bytes("b.json", b"{}").unwrap();
        store.upload_bytes("a.pdf", b"%PDF").unwrap();
        store.upload_bytes("a.pdf", b"%PDF-1.7").unwrap();

        assert_eq!(store.list_blobs().unwrap(), vec!["a.pdf", "b.json"]);
        assert!(store.blob_exists("a.pdf").unwrap());
        assert_eq!(&store.download_bytes("a.pdf").unwrap()[..], b"%PDF-1.7");

        assert!(store.delete_blob("a.pdf").unwrap());
        assert!(!store.delete_blob("a.pdf").unwrap());
        assert!(!store.blob_exists("a.pdf").unwrap());
        assert!(store.download_bytes("a.pdf").unwrap_err().is_not_found());
        assert!(store.check_health().is_ok());
    }

    #[test]
    fn test_rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::open(dir.path()).unwrap();

        for name in ["", "../escape", "nested/file", ".hidden", "a\\b"] {
            assert!(
                matches!(
                    store.upload_bytes(name, b"x"),
                    Err(StorageError::InvalidName { .. })
                ),
                "accepted {:?}",
                name
            );
        }
        assert!(store.list_blobs().unwrap().is_empty());
    }

    #[test]
    fn test_uri_points_into_root() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::open(dir.path()).unwrap();

        let uri = store.uri_for("report.pdf");
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("report.pdf"));
    }
}
