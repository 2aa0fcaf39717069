//! Upload store for CSV analytics: saves uploaded files under a configured
//! directory and produces small column/sample digests sized for generation
//! prompts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

pub const ERR_UPLOAD_INVALID: &str = "ERR_UPLOAD_INVALID";
pub const ERR_UPLOAD_IO: &str = "ERR_UPLOAD_IO";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for FileError {}

/// Column names plus a small row sample; the whole file never goes into a
/// prompt.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CsvSummary {
    pub columns: Vec<String>,
    pub sample: Vec<Value>,
}

#[derive(Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FileError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| FileError {
            code: ERR_UPLOAD_IO,
            message: format!("failed to create upload directory: {err}"),
        })?;
        Ok(Self { root })
    }

    /// Save one uploaded file. Only bare `.csv` filenames are accepted;
    /// anything that looks like a path is rejected before touching disk.
    pub fn save_csv(&self, filename: &str, bytes: &[u8]) -> Result<String, FileError> {
        let filename = filename.trim();
        if !is_safe_csv_filename(filename) {
            return Err(FileError {
                code: ERR_UPLOAD_INVALID,
                message: format!("invalid CSV filename: {filename}"),
            });
        }

        std::fs::write(self.root.join(filename), bytes).map_err(|err| FileError {
            code: ERR_UPLOAD_IO,
            message: format!("failed to save {filename}: {err}"),
        })?;

        Ok(filename.to_string())
    }

    /// CSV filenames currently in the store, sorted.
    pub fn list_csv(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.to_lowercase().ends_with(".csv"))
            .collect();
        names.sort();
        names
    }

    /// Digest every stored CSV: column names plus the first `sample_rows`
    /// records. Malformed files are logged and skipped so one bad upload
    /// does not break analysis of the rest.
    pub fn summaries(&self, sample_rows: usize) -> BTreeMap<String, CsvSummary> {
        let mut out = BTreeMap::new();

        for name in self.list_csv() {
            match summarize_file(&self.root.join(&name), sample_rows) {
                Ok(summary) => {
                    out.insert(name, summary);
                }
                Err(err) => {
                    tracing::warn!(file = %name, error = %err, "skipping unreadable CSV");
                }
            }
        }

        out
    }
}

fn summarize_file(path: &Path, sample_rows: usize) -> Result<CsvSummary, csv::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let columns: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

    let mut sample = Vec::new();
    for record in reader.records().take(sample_rows) {
        let record = record?;
        let mut row = Map::new();
        for (column, field) in columns.iter().zip(record.iter()) {
            row.insert(column.clone(), Value::String(field.to_string()));
        }
        sample.push(Value::Object(row));
    }

    Ok(CsvSummary { columns, sample })
}

fn is_safe_csv_filename(filename: &str) -> bool {
    if filename.is_empty() || filename.len() > 255 {
        return false;
    }
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return false;
    }
    if filename.starts_with('.') {
        return false;
    }
    filename.to_lowercase().ends_with(".csv")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_rejects_non_csv_and_path_traversal() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let store = UploadStore::new(dir.path()).expect("store should init");

        for bad in [
            "report.pdf",
            "../escape.csv",
            "nested/data.csv",
            ".hidden.csv",
            "",
        ] {
            let err = store.save_csv(bad, b"a,b\n1,2\n").unwrap_err();
            assert_eq!(err.code, ERR_UPLOAD_INVALID, "filename: {bad:?}");
        }
    }

    #[test]
    fn save_then_list_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let store = UploadStore::new(dir.path()).expect("store should init");

        store
            .save_csv("books.csv", b"title,year\nDune,1965\n")
            .expect("save should succeed");
        store
            .save_csv("authors.csv", b"name\nHerbert\n")
            .expect("save should succeed");

        assert_eq!(store.list_csv(), vec!["authors.csv", "books.csv"]);
    }

    #[test]
    fn summaries_capture_columns_and_bounded_sample() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let store = UploadStore::new(dir.path()).expect("store should init");

        store
            .save_csv("books.csv", b"title,year\nDune,1965\nEmma,1815\nIt,1986\n")
            .expect("save should succeed");

        let summaries = store.summaries(2);
        let books = summaries.get("books.csv").expect("summary must exist");

        assert_eq!(books.columns, vec!["title", "year"]);
        assert_eq!(books.sample.len(), 2);
        assert_eq!(books.sample[0]["title"], "Dune");
        assert_eq!(books.sample[1]["year"], "1815");
    }

    #[test]
    fn summaries_skip_files_that_fail_to_parse() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let store = UploadStore::new(dir.path()).expect("store should init");

        store
            .save_csv("good.csv", b"a,b\n1,2\n")
            .expect("save should succeed");
        // Ragged rows make the reader error on iteration.
        std::fs::write(dir.path().join("bad.csv"), b"a,b\n1,2,3,4\n\"unterminated\n")
            .expect("write should succeed");

        let summaries = store.summaries(3);
        assert!(summaries.contains_key("good.csv"));
        assert!(!summaries.contains_key("bad.csv"));
    }
}
