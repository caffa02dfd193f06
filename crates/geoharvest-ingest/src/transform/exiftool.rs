use super::{find_in_path, run_tool, ExifTag, MetadataEmbedder, TransformError};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Embeds tags with `exiftool -overwrite_original`
#[derive(Debug, Clone)]
pub struct ExiftoolEmbedder {
    program: PathBuf,
}

impl ExiftoolEmbedder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Use `exiftool` from `PATH`, if installed
    pub fn from_path() -> Option<Self> {
        find_in_path("exiftool").map(Self::new)
    }

    fn args(path: &Path, tags: &[ExifTag]) -> Vec<OsString> {
        let mut args = Vec::with_capacity(tags.len() + 2);
        args.push(OsString::from("-overwrite_original"));
        args.extend(tags.iter().map(|tag| OsString::from(tag.to_string())));
        args.push(path.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl MetadataEmbedder for ExiftoolEmbedder {
    async fn embed(&self, path: &Path, tags: &[ExifTag]) -> Result<(), TransformError> {
        if tags.is_empty() {
            return Ok(());
        }
        run_tool(&self.program, &Self::args(path, tags)).await
    }
}
