use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error};

use crate::metrics_const::UPLOADS_COUNTER;
use crate::upload::UploadSink;

/// Moves flushed batches into a local directory tree laid out like the bucket would be.
/// Used for development and when no bucket is configured.
#[derive(Debug, Clone)]
pub struct LocalDirectorySink {
    archive_dir: PathBuf,
}

impl LocalDirectorySink {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Result<Self> {
        let archive_dir = archive_dir.into();
        fs::create_dir_all(&archive_dir)
            .with_context(|| format!("Failed to create archive directory: {archive_dir:?}"))?;
        Ok(Self { archive_dir })
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    fn archive(&self, file: &Path, destination_key: &str) -> Result<PathBuf> {
        let target = self.archive_dir.join(destination_key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {parent:?}"))?;
        }

        if fs::rename(file, &target).is_err() {
            // staging and archive may live on different filesystems
            fs::copy(file, &target)
                .with_context(|| format!("Failed to copy {file:?} to {target:?}"))?;
            fs::remove_file(file)
                .with_context(|| format!("Failed to remove staged file: {file:?}"))?;
        }

        Ok(target)
    }
}

impl UploadSink for LocalDirectorySink {
    fn submit(&self, file: PathBuf, destination_key: String) {
        match self.archive(&file, &destination_key) {
            Ok(target) => {
                debug!("Archived {file:?} to {target:?}");
                metrics::counter!(UPLOADS_COUNTER, "status" => "success").increment(1);
            }
            Err(e) => {
                error!("Failed to archive {file:?} as {destination_key}: {e:#}");
                metrics::counter!(UPLOADS_COUNTER, "status" => "failure").increment(1);
            }
        }
    }

    fn shutdown(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_submit_moves_file_under_key() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let sink = LocalDirectorySink::new(archive.path()).unwrap();

        let staged = staging.path().join("0-1.txt");
        fs::write(&staged, b"a\nb\n").unwrap();

        let key = "topics/events/year=2024/month=01/day=02/hour=03/1-0".to_string();
        sink.submit(staged.clone(), key.clone());

        assert!(!staged.exists());
        assert_eq!(fs::read(archive.path().join(key)).unwrap(), b"a\nb\n");
        sink.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_missing_file_is_logged_not_fatal() {
        let archive = TempDir::new().unwrap();
        let sink = LocalDirectorySink::new(archive.path()).unwrap();

        sink.submit(
            archive.path().join("does-not-exist"),
            "topics/t/x".to_string(),
        );
        assert!(!archive.path().join("topics/t/x").exists());
    }
}
