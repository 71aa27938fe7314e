//! Local directory backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::Read;
use std::path::{Path, PathBuf};

use super::{SourceBackend, SourceUnit};
use crate::error::{CollectorError, CollectorResult};

const BACKEND_NAME: &str = "file-system";

/// Tracking logs in one local directory
#[derive(Debug, Clone)]
pub struct FileSystemBackend {
    directory: PathBuf,
}

impl FileSystemBackend {
    /// Create backend over `directory`
    #[must_use]
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    /// Directory being read
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> CollectorError {
        CollectorError::source(
            BACKEND_NAME,
            format!("{}: {}", self.directory.display(), reason),
        )
    }
}

#[async_trait]
impl SourceBackend for FileSystemBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn list(&self) -> CollectorResult<Vec<SourceUnit>> {
        let metadata = tokio::fs::metadata(&self.directory)
            .await
            .map_err(|e| self.unavailable(e))?;
        if !metadata.is_dir() {
            return Err(self.unavailable("not a directory"));
        }

        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(|e| self.unavailable(e))?;

        let mut units = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.unavailable(e))? {
            let metadata = entry.metadata().await.map_err(|e| self.unavailable(e))?;
            if !metadata.is_file() {
                continue;
            }

            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .map_err(|e| self.unavailable(e))?;

            units.push(SourceUnit {
                name: entry.file_name().to_string_lossy().into_owned(),
                created: DateTime::<Utc>::from(created),
                size: metadata.len(),
            });
        }

        Ok(units)
    }

    async fn open(&self, unit: &SourceUnit) -> CollectorResult<Box<dyn Read + Send>> {
        let path = self.directory.join(&unit.name);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| self.unavailable(format!("cannot open {}: {}", unit.name, e)))?;
        Ok(Box::new(file.into_std().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lists_regular_files() -> CollectorResult<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("tracking.log"), b"{}\n")?;
        std::fs::write(dir.path().join("tracking.log-1.gz"), b"")?;
        std::fs::create_dir(dir.path().join("nested"))?;

        let backend = FileSystemBackend::new(dir.path());
        let mut names: Vec<String> = backend.list().await?.into_iter().map(|u| u.name).collect();
        names.sort();

        assert_eq!(names, vec!["tracking.log", "tracking.log-1.gz"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_directory_is_a_source_error() {
        let backend = FileSystemBackend::new("/definitely/not/here/tracking");
        let result = backend.list().await;
        assert!(matches!(result, Err(ref e) if e.is_transport()));
    }

    #[tokio::test]
    async fn test_open_reads_content() -> CollectorResult<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("tracking.log"), b"line\n")?;

        let backend = FileSystemBackend::new(dir.path());
        let units = backend.list().await?;
        let mut content = String::new();
        backend.open(&units[0]).await?.read_to_string(&mut content)?;

        assert_eq!(content, "line\n");
        Ok(())
    }
}
