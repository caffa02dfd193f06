//! Saved crawl position, `{"next": <url|null>}`

use crate::crawl::validate_cursor;
use crate::error::Result;
use geoharvest_common::atomic::write_json_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CursorFile {
    next: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The saved continuation URL, if any
    ///
    /// A saved value that is not a resumable URL is an error rather than a
    /// silent restart.
    pub fn load(&self) -> Result<Option<String>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: CursorFile = serde_json::from_slice(&bytes)?;
        match file.next {
            Some(next) => {
                validate_cursor(&next)?;
                Ok(Some(next))
            },
            None => Ok(None),
        }
    }

    pub fn save(&self, next: Option<&str>) -> Result<()> {
        let file = CursorFile {
            next: next.map(str::to_string),
        };
        write_json_atomic(&self.path, &file)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::IngestError;

    #[test]
    fn test_missing_file_means_fresh_crawl() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("cursor.json"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("cursor.json"));

        store.save(Some("https://graph.mapillary.com/images?after=xyz")).unwrap();
        assert_eq!(
            store.load().unwrap().as_deref(),
            Some("https://graph.mapillary.com/images?after=xyz")
        );

        store.save(None).unwrap();
        assert_eq!(store.load().unwrap(), None);
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw, r#"{"next":null}"#);
    }

    #[test]
    fn test_non_url_cursor_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        std::fs::write(&path, r#"{"next": "after=xyz"}"#).unwrap();

        let err = CursorStore::new(path).load().unwrap_err();
        assert!(matches!(err, IngestError::InvalidCursor(_)));
        assert!(err.is_fatal());
    }
}
