//! Service configuration loaded from an optional config file and `INGEST__*`
//! environment variables.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default = "default_processing")]
    pub processing: ProcessingConfig,

    #[serde(default = "default_cleanup")]
    pub cleanup: CleanupConfig,
}

/// Filesystem locations
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Where uploads are staged before processing. Swept by the cleanup loop.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Root directory of the local blob store.
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,

    /// Optional inbox. Files placed here are staged and submitted automatically.
    #[serde(default)]
    pub inbox_dir: Option<PathBuf>,
}

/// Task processing settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Worker threads. One worker serializes embedding-API usage.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_bot_id")]
    pub default_bot_id: String,

    /// Require a metadata row for uploaded files (PDFs fail without one).
    #[serde(default)]
    pub require_metadata: bool,

    /// Skip indexing a PDF when a Word document with the same stem is stored.
    #[serde(default = "default_true")]
    pub skip_pdf_with_word_original: bool,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Age in days after which finished uploads are dropped from memory.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// Temp-upload cleanup sweep settings
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_file_age_threshold_secs")]
    pub file_age_threshold_secs: u64,
}

impl AppConfig {
    /// Load configuration from `config.*` (optional) and the environment.
    pub fn load() -> ServiceResult<Self> {
        Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build config: {}", e),
            })?
            .try_deserialize()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to deserialize config: {}", e),
            })
    }

    /// Directory holding per-worker partial file lists.
    pub fn worker_lists_dir(&self) -> PathBuf {
        self.storage.temp_dir.join("worker_file_lists")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            processing: default_processing(),
            cleanup: default_cleanup(),
        }
    }
}

impl ProcessingConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn file_age_threshold(&self) -> Duration {
        Duration::from_secs(self.file_age_threshold_secs)
    }
}

// ==================== Default Value Functions ====================

fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
        temp_dir: default_temp_dir(),
        blob_dir: default_blob_dir(),
        inbox_dir: None,
    }
}

fn default_processing() -> ProcessingConfig {
    ProcessingConfig {
        max_workers: default_max_workers(),
        default_bot_id: default_bot_id(),
        require_metadata: false,
        skip_pdf_with_word_original: true,
        shutdown_timeout_secs: default_shutdown_timeout_secs(),
        retention_days: default_retention_days(),
    }
}

fn default_cleanup() -> CleanupConfig {
    CleanupConfig {
        interval_secs: default_cleanup_interval_secs(),
        file_age_threshold_secs: default_file_age_threshold_secs(),
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./data/temp_uploads")
}

fn default_blob_dir() -> PathBuf {
    PathBuf::from("./data/blobs")
}

fn default_max_workers() -> usize {
    1
}

fn default_bot_id() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    7
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_file_age_threshold_secs() -> u64 {
    3600
}
