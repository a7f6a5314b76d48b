use crate::models::UploadedFile;
use crate::services::error::ProcessingError;
use std::path::Path;
use tracing::{debug, warn};

/// Ownership of one staged upload while the archiver works on it.
///
/// Claiming a file makes the archiver responsible for deleting it. The
/// deletion is attempted by [`TempUpload::release`], or on drop if the
/// processing future was cancelled before it got that far.
#[derive(Debug)]
pub struct TempUpload {
    file: UploadedFile,
    released: bool,
}

impl TempUpload {
    pub fn claim(file: UploadedFile) -> Self {
        Self {
            file,
            released: false,
        }
    }

    pub fn original_name(&self) -> &str {
        &self.file.original_name
    }

    pub fn path(&self) -> &Path {
        &self.file.temp_path
    }

    pub fn archive_name(&self) -> String {
        self.file.archive_name()
    }

    pub async fn read(&self) -> Result<Vec<u8>, ProcessingError> {
        Ok(tokio::fs::read(self.path()).await?)
    }

    /// Delete the temp file. Failures are logged and returned but never fatal.
    pub async fn release(mut self) -> Result<(), ProcessingError> {
        self.released = true;
        match tokio::fs::remove_file(self.path()).await {
            Ok(()) => {
                debug!("🧹 Removed temp file {}", self.path().display());
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to remove temp file {} for '{}': {}",
                    self.path().display(),
                    self.original_name(),
                    e
                );
                Err(ProcessingError::Cleanup(e.to_string()))
            }
        }
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.file.temp_path) {
            warn!(
                "Failed to remove abandoned temp file {}: {}",
                self.file.temp_path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.upload");
        std::fs::write(&path, b"data").unwrap();

        let upload = TempUpload::claim(UploadedFile::new("a.png", &path));
        assert_eq!(upload.read().await.unwrap(), b"data");
        upload.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_release_of_missing_file_is_cleanup_error() {
        let dir = tempfile::tempdir().unwrap();
        let upload = TempUpload::claim(UploadedFile::new("a.png", dir.path().join("gone")));
        assert!(matches!(
            upload.release().await,
            Err(ProcessingError::Cleanup(_))
        ));
    }

    #[test]
    fn test_drop_without_release_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.upload");
        std::fs::write(&path, b"data").unwrap();

        drop(TempUpload::claim(UploadedFile::new("b.png", &path)));
        assert!(!path.exists());
    }
}
