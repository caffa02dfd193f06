//! In-place transforms applied to a downloaded asset
//!
//! The worker only depends on the two traits here. Production uses the
//! external `exiftool` and `cwebp` binaries; tests plug in in-process
//! implementations.

mod exiftool;
mod tags;
mod webp;

pub use exiftool::ExiftoolEmbedder;
pub use tags::{exif_tags, panorama_tags, ExifTag};
pub use webp::CwebpConverter;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes tags into an asset file in place
#[async_trait]
pub trait MetadataEmbedder: Send + Sync {
    async fn embed(&self, path: &Path, tags: &[ExifTag]) -> Result<(), TransformError>;
}

/// Re-encodes an asset, returning the path of the new file
///
/// On success the source file is gone; on failure it is left untouched.
#[async_trait]
pub trait FormatConverter: Send + Sync {
    async fn convert(&self, source: &Path) -> Result<PathBuf, TransformError>;
}

/// Embedder that leaves files untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmbedder;

#[async_trait]
impl MetadataEmbedder for NoopEmbedder {
    async fn embed(&self, _path: &Path, _tags: &[ExifTag]) -> Result<(), TransformError> {
        Ok(())
    }
}

/// Locate `program` on `PATH`
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

/// Run an external tool, mapping a non-zero exit to [`TransformError::Failed`]
pub(crate) async fn run_tool(
    program: &Path,
    args: &[std::ffi::OsString],
) -> Result<(), TransformError> {
    let name = program.display().to_string();
    let output = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| TransformError::Spawn {
            program: name.clone(),
            source,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(TransformError::Failed {
            program: name,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
