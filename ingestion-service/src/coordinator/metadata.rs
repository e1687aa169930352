//! Per-file metadata rows supplied alongside uploads.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::IngestionCoordinator;
use super::types::MetadataInfo;
use crate::catalog::MetadataRow;
use crate::error::{ServiceError, ServiceResult};

/// Column every row must carry
pub const FILE_NAME_COLUMN: &str = "file_name";

/// Rows keyed by the `file_name` column
#[derive(Debug, Clone)]
pub struct MetadataTable {
    rows: Vec<MetadataRow>,
    columns: Vec<String>,
    loaded_at: DateTime<Utc>,
}

impl MetadataTable {
    /// Validate and index rows. Every row needs a non-empty `file_name`.
    pub fn new(rows: Vec<MetadataRow>) -> ServiceResult<Self> {
        let mut columns = BTreeSet::new();
        for (index, row) in rows.iter().enumerate() {
            if row
                .get(FILE_NAME_COLUMN)
                .is_none_or(|name| name.trim().is_empty())
            {
                return Err(ServiceError::Metadata {
                    message: format!("Row {} has no {} value", index + 1, FILE_NAME_COLUMN),
                });
            }
            columns.extend(row.keys().cloned());
        }

        Ok(Self {
            rows,
            columns: columns.into_iter().collect(),
            loaded_at: Utc::now(),
        })
    }

    pub fn info(&self) -> MetadataInfo {
        MetadataInfo {
            loaded: true,
            rows: self.rows.len(),
            columns: self.columns.clone(),
            loaded_at: Some(self.loaded_at),
        }
    }

    /// Find the row for `filename`: exact (case-insensitive) first, then
    /// ignoring the extension. The `file_name` column is not returned.
    pub fn lookup(&self, filename: &str) -> Option<MetadataRow> {
        let wanted = filename.trim().to_lowercase();
        let wanted_stem = stem(&wanted);

        let row = self
            .rows
            .iter()
            .find(|row| row_file_name(row) == wanted)
            .or_else(|| {
                self.rows
                    .iter()
                    .find(|row| stem(&row_file_name(row)) == wanted_stem)
            })?;

        let mut found = row.clone();
        found.remove(FILE_NAME_COLUMN);
        Some(found)
    }
}

fn row_file_name(row: &MetadataRow) -> String {
    row.get(FILE_NAME_COLUMN)
        .map(|name| name.trim().to_lowercase())
        .unwrap_or_default()
}

fn stem(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
        .to_string()
}

fn is_pdf(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

impl IngestionCoordinator {
    /// Replace the metadata table
    pub fn set_metadata(&self, rows: Vec<MetadataRow>) -> ServiceResult<MetadataInfo> {
        let table = MetadataTable::new(rows)?;
        let info = table.info();
        *self.write_metadata() = Some(table);
        info!(rows = info.rows, columns = info.columns.len(), "Loaded file metadata");
        Ok(info)
    }

    pub fn get_metadata_info(&self) -> MetadataInfo {
        self.read_metadata()
            .as_ref()
            .map(MetadataTable::info)
            .unwrap_or_default()
    }

    /// Metadata to attach to `filename`, applying the `require_metadata` policy
    pub(super) fn resolve_metadata(&self, filename: &str) -> ServiceResult<Option<MetadataRow>> {
        let required = self.config.processing.require_metadata;
        let table = self.read_metadata();

        let Some(table) = table.as_ref() else {
            if required {
                return Err(ServiceError::Metadata {
                    message: "Metadata is required but no metadata has been loaded".to_string(),
                });
            }
            return Ok(None);
        };

        match table.lookup(filename) {
            Some(row) => Ok(Some(row)),
            None if required && is_pdf(filename) => Err(ServiceError::Metadata {
                message: format!("No metadata found for {}", filename),
            }),
            None => {
                if required {
                    warn!(filename = %filename, "No metadata found, continuing without it");
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> MetadataRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_rows_require_file_name() {
        let result = MetadataTable::new(vec![row(&[("title", "No name")])]);
        assert!(matches!(result, Err(ServiceError::Metadata { .. })));

        let result = MetadataTable::new(vec![row(&[("file_name", "  ")])]);
        assert!(matches!(result, Err(ServiceError::Metadata { .. })));
    }

    #[test]
    fn test_lookup_exact_then_ignoring_extension() {
        let table = MetadataTable::new(vec![
            row(&[("file_name", "Report.PDF"), ("publisher", "ACME")]),
            row(&[("file_name", "manual.docx"), ("publisher", "Initech")]),
        ])
        .unwrap();

        let found = table.lookup("report.pdf").unwrap();
        assert_eq!(found.get("publisher").map(String::as_str), Some("ACME"));
        assert!(!found.contains_key(FILE_NAME_COLUMN));

        let by_stem = table.lookup("manual.pdf").unwrap();
        assert_eq!(by_stem.get("publisher").map(String::as_str), Some("Initech"));

        assert!(table.lookup("other.pdf").is_none());

        let info = table.info();
        assert!(info.loaded);
        assert_eq!(info.rows, 2);
        assert_eq!(info.columns, vec!["file_name", "publisher"]);
    }
}
