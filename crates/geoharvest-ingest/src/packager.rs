//! Seals per-day staging directories into tar bundles
//!
//! Every `YYYY-MM-DD` (or `unknown-date`) directory directly under the
//! collection root becomes one `<date>.tar`. Entries are written in sorted
//! relative-path order with normalized ownership and permissions, so two
//! trees with the same paths, contents and mtimes produce byte-identical
//! bundles on any host.
//!
//! An existing bundle is never replaced: the next free `<date>.<n>.tar` is
//! used instead. A bundle only appears under its final name once it is
//! complete, and the source directory is removed only after that.

use crate::error::{IngestError, Result};
use crate::layout::{META_DIR, UNKNOWN_DATE};
use geoharvest_common::checksum::sha256_file;
use geoharvest_common::format::format_size;
use regex::Regex;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

const DATE_DIR_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}$";

/// Upper bound on addendum lookups; reaching it means something is wrong
const MAX_ADDENDUM: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSummary {
    pub path: PathBuf,
    pub files: usize,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Default)]
pub struct SealReport {
    pub bundles: Vec<BundleSummary>,
    pub files_sealed: usize,
    /// Date directories without any files, left in place
    pub skipped_empty: Vec<String>,
    /// Date directories that could not be sealed, or whose source was left
    /// behind after sealing and would be bundled again as an addendum
    pub failed: Vec<(String, String)>,
}

impl SealReport {
    pub fn bundles_created(&self) -> usize {
        self.bundles.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.bundles.iter().map(|b| b.bytes).sum()
    }
}

/// Seal every date directory under `collection_root`
///
/// A failure on one directory is logged and recorded in the report; the
/// remaining directories are still sealed.
pub fn seal(collection_root: &Path) -> Result<SealReport> {
    if !collection_root.is_dir() {
        return Err(IngestError::config(format!(
            "collection directory not found: {}",
            collection_root.display()
        )));
    }

    let date_dirs = find_date_dirs(collection_root)?;
    let mut report = SealReport::default();

    if date_dirs.is_empty() {
        info!(root = %collection_root.display(), "No date directories to seal");
        return Ok(report);
    }
    info!(directories = date_dirs.len(), "Sealing date directories");

    for (name, dir) in date_dirs {
        let files = collect_files(collection_root, &dir)?;
        if files.is_empty() {
            warn!(date = %name, "Skipping empty date directory");
            report.skipped_empty.push(name);
            continue;
        }

        match seal_directory(collection_root, &name, &files) {
            Ok(summary) => {
                info!(
                    date = %name,
                    bundle = %summary.path.display(),
                    files = summary.files,
                    size = %format_size(summary.bytes),
                    "Sealed date directory"
                );
                record_sealed(&mut report, name, summary, std::fs::remove_dir_all(&dir));
            },
            Err(e) => {
                error!(date = %name, error = %e, "Failed to seal date directory");
                report.failed.push((name, e.to_string()));
            },
        }
    }

    info!(
        bundles = report.bundles_created(),
        files = report.files_sealed,
        size = %format_size(report.total_bytes()),
        "Sealing finished"
    );
    Ok(report)
}

fn record_sealed(
    report: &mut SealReport,
    name: String,
    summary: BundleSummary,
    cleanup: std::io::Result<()>,
) {
    if let Err(e) = cleanup {
        error!(date = %name, error = %e, "Bundle written but source directory not removed");
        report
            .failed
            .push((name, format!("sealed into {} but not removed: {e}", summary.path.display())));
    }
    report.files_sealed += summary.files;
    report.bundles.push(summary);
}

/// [`seal`] on the blocking thread pool
pub async fn seal_blocking(collection_root: PathBuf) -> Result<SealReport> {
    tokio::task::spawn_blocking(move || seal(&collection_root)).await?
}

fn find_date_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let pattern = Regex::new(DATE_DIR_PATTERN)
        .map_err(|e| IngestError::config(format!("invalid date pattern: {e}")))?;

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name == META_DIR {
            continue;
        }
        if pattern.is_match(&name) || name == UNKNOWN_DATE {
            dirs.push((name, entry.path()));
        }
    }

    dirs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(dirs)
}

/// Regular files under `dir` as (path relative to `root`, absolute path),
/// sorted by relative path
fn collect_files(root: &Path, dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|e| IngestError::archive(&path, e))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((relative, path));
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn seal_directory(root: &Path, name: &str, files: &[(String, PathBuf)]) -> Result<BundleSummary> {
    let temp = NamedTempFile::new_in(root)?;
    let mut temp = write_bundle(temp, files)?;
    temp.as_file_mut().sync_all()?;

    // Look for a free name; persist_noclobber guards against a bundle
    // appearing between the existence check and the rename
    let mut addendum = 0;
    let path = loop {
        let candidate = bundle_path(root, name, addendum);
        if candidate.exists() {
            addendum += 1;
        } else {
            match temp.persist_noclobber(&candidate) {
                Ok(_) => break candidate,
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    temp = e.file;
                    addendum += 1;
                },
                Err(e) => return Err(IngestError::archive(&candidate, e.error)),
            }
        }
        if addendum > MAX_ADDENDUM {
            return Err(IngestError::archive(
                &bundle_path(root, name, 0),
                "no free addendum name",
            ));
        }
    };
    if addendum > 0 {
        info!(date = %name, bundle = %path.display(), "Existing bundle kept, wrote addendum");
    }

    Ok(BundleSummary {
        bytes: std::fs::metadata(&path)?.len(),
        sha256: sha256_file(&path)?,
        files: files.len(),
        path,
    })
}

/// `<name>.tar`, then `<name>.1.tar`, `<name>.2.tar`, ...
pub fn bundle_path(root: &Path, name: &str, addendum: u32) -> PathBuf {
    if addendum == 0 {
        root.join(format!("{name}.tar"))
    } else {
        root.join(format!("{name}.{addendum}.tar"))
    }
}

fn write_bundle(temp: NamedTempFile, files: &[(String, PathBuf)]) -> Result<NamedTempFile> {
    let mut builder = tar::Builder::new(temp);

    for (relative, path) in files {
        let mut file = File::open(path)?;
        let metadata = file.metadata()?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(metadata.len());
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_uid(0);
        header.set_gid(0);
        header
            .set_username("")
            .map_err(|e| IngestError::archive(path, e))?;
        header
            .set_groupname("")
            .map_err(|e| IngestError::archive(path, e))?;

        builder
            .append_data(&mut header, relative, &mut file)
            .map_err(|e| IngestError::archive(path, e))?;
    }

    let mut temp = builder
        .into_inner()
        .map_err(|e| IngestError::archive(Path::new("bundle"), e))?;
    temp.flush()?;
    Ok(temp)
}
