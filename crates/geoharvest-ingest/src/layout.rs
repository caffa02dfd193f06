//! On-disk arrangement of a collection directory

use crate::config::StagingLayout;
use crate::record::Record;
use std::path::{Path, PathBuf};

/// Bucket for records without a sequence
pub const UNKNOWN_SEQUENCE: &str = "unknown-sequence";
/// Bucket for records without a capture time
pub const UNKNOWN_DATE: &str = "unknown-date";
/// State directory, ignored by the packager
pub const META_DIR: &str = ".meta";

pub const ASSET_EXTENSION: &str = "jpg";

/// Paths inside one collection directory
#[derive(Debug, Clone)]
pub struct CollectionPaths {
    root: PathBuf,
}

impl CollectionPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    pub fn metadata_log(&self, compressed: bool) -> PathBuf {
        let name = if compressed {
            "metadata.jsonl.gz"
        } else {
            "metadata.jsonl"
        };
        self.meta_dir().join(name)
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.meta_dir().join("progress.json")
    }

    pub fn cursor(&self) -> PathBuf {
        self.meta_dir().join("cursor.json")
    }

    /// Where the downloaded asset for `record` goes
    pub fn asset_path(&self, layout: StagingLayout, record: &Record) -> PathBuf {
        self.root
            .join(layout.group_dir(record))
            .join(format!("{}.{}", safe_component(&record.id), ASSET_EXTENSION))
    }
}

impl StagingLayout {
    /// Directory of `record` relative to the collection root
    pub fn group_dir(&self, record: &Record) -> PathBuf {
        let sequence = sequence_key(record);
        match self {
            StagingLayout::Sequence => PathBuf::from(sequence),
            StagingLayout::Date => PathBuf::from(date_key(record)).join(sequence),
        }
    }
}

pub fn sequence_key(record: &Record) -> String {
    record
        .sequence
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(safe_component)
        .unwrap_or_else(|| UNKNOWN_SEQUENCE.to_string())
}

/// `YYYY-MM-DD` of the capture time in UTC, or [`UNKNOWN_DATE`]
pub fn date_key(record: &Record) -> String {
    record
        .captured_at_utc()
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| UNKNOWN_DATE.to_string())
}

/// Keep API-supplied names from escaping the collection directory
fn safe_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
