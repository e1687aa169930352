//! File catalog documents: the canonical per-bot catalog and the partial
//! per-worker lists that are folded into it.

mod worker_store;

pub use worker_store::WorkerFileStore;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Metadata row attached to a catalog entry
pub type MetadataRow = BTreeMap<String, String>;

/// Writer recorded on catalogs produced by a merge
pub const MERGE_UPDATED_BY: &str = "background_processor_merge";

/// Writer recorded on catalogs updated per processed file
pub const FILE_UPDATED_BY: &str = "background_processor";

/// Fixed-width UTC timestamp, so string order matches time order
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Canonical catalog blob name for a bot
pub fn catalog_name(bot_id: &str) -> String {
    format!("{}-filelist.json", bot_id)
}

/// Prefix shared by a bot's worker-scoped lists
pub fn worker_list_prefix(bot_id: &str) -> String {
    format!("{}-filelist-worker-", bot_id)
}

/// Worker-scoped list file name
pub fn worker_list_name(bot_id: &str, worker_id: &str) -> String {
    format!("{}{}.json", worker_list_prefix(bot_id), worker_id)
}

/// Whether an upload named `filename` would land on a catalog document of some bot
pub fn is_reserved_name(filename: &str) -> bool {
    let name = filename.to_ascii_lowercase();
    name.ends_with("-filelist.json")
        || (name.contains("-filelist-worker-") && name.ends_with(".json"))
}

/// Content type from the file extension
pub fn content_type_for(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "doc" => "application/msword",
        "csv" => "text/csv",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Outcome recorded for a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Completed,
    Failed,
}

/// One file in a catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub file_name: String,
    pub size: u64,
    #[serde(default, alias = "uri")]
    pub file_uri: String,
    #[serde(default)]
    pub uploaded_at: String,
    /// ISO-8601; the greatest value wins when entries collide
    #[serde(default)]
    pub processed_at: String,
    pub status: EntryStatus,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataRow>,
}

impl FileEntry {
    pub fn new(name: &str, size: u64, file_uri: String, status: EntryStatus) -> Self {
        let now = timestamp_now();
        Self {
            name: name.to_string(),
            file_name: name.to_string(),
            size,
            file_uri,
            uploaded_at: now.clone(),
            processed_at: now,
            status,
            content_type: content_type_for(name).to_string(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<MetadataRow>) -> Self {
        self.metadata = metadata.filter(|m| !m.is_empty());
        self
    }

    /// Catalog key
    pub fn key(&self) -> &str {
        if self.name.is_empty() {
            &self.file_name
        } else {
            &self.name
        }
    }

    fn matches(&self, filename: &str) -> bool {
        self.name == filename || self.file_name == filename
    }
}

/// Partial catalog contributed by one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFileList {
    pub worker_id: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    pub created_at: String,
    pub updated_at: String,
}

impl WorkerFileList {
    pub fn new(worker_id: &str) -> Self {
        let now = timestamp_now();
        Self {
            worker_id: worker_id.to_string(),
            files: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Replace the entry with the same name, or append
    pub fn record(&mut self, entry: FileEntry) {
        upsert_entry(&mut self.files, entry);
        self.updated_at = timestamp_now();
    }
}

/// Per-worker summary included in merge results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerListStats {
    pub file_count: usize,
    pub created_at: String,
    pub updated_at: String,
}

/// Details of the merge that produced a catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeInfo {
    pub merged_at: String,
    pub worker_count: usize,
    pub total_entries_processed: usize,
    pub unique_files: usize,
    pub duplicates_removed: usize,
    pub worker_stats: BTreeMap<String, WorkerListStats>,
}

/// Canonical, deduplicated catalog for a bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedFileList {
    #[serde(alias = "BotID")]
    pub bot_id: String,
    pub updated_at: String,
    #[serde(default)]
    pub updated_by: String,
    #[serde(default)]
    pub total_files: usize,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_info: Option<MergeInfo>,
}

impl MergedFileList {
    pub fn empty(bot_id: &str) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            updated_at: timestamp_now(),
            updated_by: FILE_UPDATED_BY.to_string(),
            total_files: 0,
            files: Vec::new(),
            merge_info: None,
        }
    }

    /// Insert or replace the entry for `entry.name`
    pub fn upsert(&mut self, entry: FileEntry) {
        upsert_entry(&mut self.files, entry);
        self.total_files = self.files.len();
        self.updated_at = timestamp_now();
        self.updated_by = FILE_UPDATED_BY.to_string();
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.key().to_string()).collect()
    }
}

fn upsert_entry(files: &mut Vec<FileEntry>, entry: FileEntry) {
    match files.iter_mut().find(|f| f.matches(&entry.name)) {
        Some(existing) => *existing = entry,
        None => files.push(entry),
    }
}

/// Collapse entries sharing a name, keeping the greatest `processed_at`.
///
/// Order follows each name's first appearance. On equal timestamps the
/// earlier entry stays.
pub fn dedupe_latest(entries: impl IntoIterator<Item = FileEntry>) -> Vec<FileEntry> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<FileEntry> = Vec::new();

    for entry in entries {
        let key = entry.key().to_string();
        if key.is_empty() {
            continue;
        }
        match positions.get(&key) {
            Some(&index) => {
                if entry.processed_at > unique[index].processed_at {
                    unique[index] = entry;
                }
            }
            None => {
                positions.insert(key, unique.len());
                unique.push(entry);
            }
        }
    }

    unique
}
