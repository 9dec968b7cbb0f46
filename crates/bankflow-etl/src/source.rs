//! Source file collaborators.
//!
//! The extractor consumes an ordered, finite list of `(path, bytes)` pairs and
//! never walks the filesystem itself. [`DirectorySource`] is the production
//! implementation; tests hand in [`SourceFile`]s directly.

use crate::error::EtlResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub content: Vec<u8>,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Final path component, used for entity resolution.
    pub fn file_name(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.path)
    }
}

#[async_trait]
pub trait FileSource: Send + Sync {
    /// Files to offer to the current extract run, in processing order.
    async fn list(&self) -> EtlResult<Vec<SourceFile>>;
}

/// All `*.csv` files directly inside a directory, sorted by file name.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl FileSource for DirectorySource {
    async fn list(&self) -> EtlResult<Vec<SourceFile>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            warn!(dir = %self.dir.display(), "Data directory does not exist, nothing to extract");
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_csv = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            if is_csv && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let content = tokio::fs::read(&path).await?;
            debug!(path = %path.display(), bytes = content.len(), "Read source file");
            files.push(SourceFile::new(path.to_string_lossy(), content));
        }
        Ok(files)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lists_csv_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("loans.csv"), "loan_id\n").unwrap();
        std::fs::write(dir.path().join("branches.CSV"), "branch_id\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        std::fs::create_dir(dir.path().join("archive.csv")).unwrap();

        let files = DirectorySource::new(dir.path()).list().await.unwrap();
        let names: Vec<&str> = files.iter().map(SourceFile::file_name).collect();
        assert_eq!(names, vec!["branches.CSV", "loans.csv"]);
        assert_eq!(files[1].content, b"loan_id\n");
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = DirectorySource::new(dir.path().join("absent"))
            .list()
            .await
            .unwrap();
        assert!(files.is_empty());
    }
}
