use super::{find_in_path, run_tool, FormatConverter, TransformError};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Converts to WebP with `cwebp -metadata all`, deleting the source on success
#[derive(Debug, Clone)]
pub struct CwebpConverter {
    program: PathBuf,
}

impl CwebpConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Use `cwebp` from `PATH`, if installed
    pub fn from_path() -> Option<Self> {
        find_in_path("cwebp").map(Self::new)
    }

    fn args(source: &Path, dest: &Path) -> Vec<OsString> {
        vec![
            "-metadata".into(),
            "all".into(),
            source.as_os_str().to_owned(),
            "-o".into(),
            dest.as_os_str().to_owned(),
        ]
    }
}

#[async_trait]
impl FormatConverter for CwebpConverter {
    async fn convert(&self, source: &Path) -> Result<PathBuf, TransformError> {
        let dest = source.with_extension("webp");

        if let Err(e) = run_tool(&self.program, &Self::args(source, &dest)).await {
            if let Err(cleanup) = tokio::fs::remove_file(&dest).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dest.display(), error = %cleanup, "Failed to remove partial WebP");
                }
            }
            return Err(e);
        }

        tokio::fs::remove_file(source).await?;
        Ok(dest)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args = CwebpConverter::args(Path::new("a/img1.jpg"), Path::new("a/img1.webp"));
        assert_eq!(args, ["-metadata", "all", "a/img1.jpg", "-o", "a/img1.webp"]);
    }

    #[tokio::test]
    async fn test_failed_conversion_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("img1.jpg");
        std::fs::write(&source, b"jpeg bytes").unwrap();

        let converter = CwebpConverter::new("/nonexistent/cwebp");
        let result = converter.convert(&source).await;

        assert!(result.is_err());
        assert!(source.exists());
        assert!(!dir.path().join("img1.webp").exists());
    }
}
