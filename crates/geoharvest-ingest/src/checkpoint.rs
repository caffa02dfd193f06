//! Progress checkpoint: ids whose asset is durably on disk, per quality
//!
//! The file maps a quality label to a sorted array of ids:
//!
//! ```json
//! {"1024": ["img1", "img7"], "original": ["img1"]}
//! ```
//!
//! Only the coordinator writes it. Flushes go through a temp file, fsync
//! and rename, so a reader sees either the previous or the new state.

use crate::error::Result;
use geoharvest_common::atomic::write_json_atomic;
use geoharvest_common::Quality;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

type QualitySets = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug)]
pub struct ProgressCheckpoint {
    path: PathBuf,
    quality: Quality,
    sets: QualitySets,
    unflushed: usize,
}

impl ProgressCheckpoint {
    /// Load the checkpoint for `quality`; a missing file is an empty checkpoint
    ///
    /// Sets belonging to other qualities are kept and written back untouched.
    pub fn load(path: impl Into<PathBuf>, quality: Quality) -> Result<Self> {
        let path = path.into();
        let sets: QualitySets = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => QualitySets::new(),
            Err(e) => return Err(e.into()),
        };

        let checkpoint = Self {
            path,
            quality,
            sets,
            unflushed: 0,
        };
        debug!(
            quality = %quality,
            completed = checkpoint.len(),
            "Loaded progress checkpoint"
        );
        Ok(checkpoint)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &str) -> bool {
        self.completed().is_some_and(|set| set.contains(id))
    }

    pub fn len(&self) -> usize {
        self.completed().map_or(0, BTreeSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids completed at this checkpoint's quality
    pub fn completed_ids(&self) -> impl Iterator<Item = &str> {
        self.completed().into_iter().flatten().map(String::as_str)
    }

    /// Mark `id` as completed in memory; returns false if it already was
    pub fn record(&mut self, id: impl Into<String>) -> bool {
        let inserted = self
            .sets
            .entry(self.quality.as_str().to_string())
            .or_default()
            .insert(id.into());
        if inserted {
            self.unflushed += 1;
        }
        inserted
    }

    /// Completions recorded since the last flush
    pub fn unflushed(&self) -> usize {
        self.unflushed
    }

    /// Atomically persist the full state
    pub fn flush(&mut self) -> Result<()> {
        write_json_atomic(&self.path, &self.sets)?;
        debug!(
            path = %self.path.display(),
            completed = self.len(),
            newly_flushed = self.unflushed,
            "Flushed progress checkpoint"
        );
        self.unflushed = 0;
        Ok(())
    }

    fn completed(&self) -> Option<&BTreeSet<String>> {
        self.sets.get(self.quality.as_str())
    }
}
