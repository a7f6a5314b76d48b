use crate::api::error::AppError;
use crate::models::UploadedFile;
use axum::extract::Multipart;
use axum::extract::multipart::{Field, MultipartError};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of every staged upload; the sweeper only touches these files.
pub const STAGING_PREFIX: &str = ".upload-";

/// Rules the collector enforces before anything reaches the archiver.
#[derive(Debug, Clone)]
pub struct CollectorLimits {
    pub field_name: String,
    pub max_files: usize,
    /// Longest wait for the next piece of the request body.
    pub idle_timeout: Duration,
}

/// Staged files of a request that has not handed them over yet.
///
/// If the request is rejected or its future is dropped, every file staged
/// so far is removed, including one that was still being written.
#[derive(Debug)]
struct StagedUploads {
    files: Vec<UploadedFile>,
    partial: Option<PathBuf>,
    armed: bool,
}

impl StagedUploads {
    fn new() -> Self {
        Self {
            files: Vec::new(),
            partial: None,
            armed: true,
        }
    }

    fn len(&self) -> usize {
        self.files.len()
    }

    fn begin(&mut self, path: PathBuf) {
        self.partial = Some(path);
    }

    fn complete(&mut self, original_name: String) {
        if let Some(path) = self.partial.take() {
            self.files.push(UploadedFile::new(original_name, path));
        }
    }

    fn paths(&self) -> impl Iterator<Item = &Path> {
        self.partial
            .iter()
            .map(PathBuf::as_path)
            .chain(self.files.iter().map(|f| f.temp_path.as_path()))
    }

    /// Hand the staged files over; they are no longer removed on drop.
    fn into_files(mut self) -> Vec<UploadedFile> {
        self.armed = false;
        std::mem::take(&mut self.files)
    }

    async fn discard(mut self) {
        self.armed = false;
        for path in self.paths() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove staged file {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for StagedUploads {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in self.paths() {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("🧹 Removed staged file {} of an abandoned request", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove staged file {}: {}", path.display(), e),
            }
        }
    }
}

/// Stage every file of a multipart request and return them in upload order.
///
/// Non-file fields are ignored. A file under the wrong field name, or one
/// past `max_files`, rejects the whole request; the collector then removes
/// what it already staged and drains the rest of the body. A body that
/// stalls for longer than `idle_timeout` is rejected with 408.
pub async fn collect_uploads(
    multipart: &mut Multipart,
    staging_dir: &Path,
    limits: &CollectorLimits,
) -> Result<Vec<UploadedFile>, AppError> {
    let mut staged = StagedUploads::new();

    match stage_fields(multipart, staging_dir, limits, &mut staged).await {
        Ok(()) => Ok(staged.into_files()),
        Err(e) => {
            warn!("Upload rejected: {}. Discarding staged files...", e);
            staged.discard().await;
            // Consume the remaining multipart stream so the client sees our reply
            // instead of a connection reset. A stalled client gets no such courtesy.
            if !matches!(e, AppError::RequestTimeout(_)) {
                drain(multipart, limits.idle_timeout).await;
            }
            Err(e)
        }
    }
}

async fn stage_fields(
    multipart: &mut Multipart,
    staging_dir: &Path,
    limits: &CollectorLimits,
    staged: &mut StagedUploads,
) -> Result<(), AppError> {
    let idle = limits.idle_timeout;

    while let Some(field) = within(idle, multipart.next_field()).await? {
        let Some(original_name) = field.file_name().map(str::to_string) else {
            continue;
        };

        let name = field.name().unwrap_or_default();
        if name != limits.field_name {
            return Err(AppError::BadRequest(format!(
                "Unexpected file field '{}', expected '{}'",
                name, limits.field_name
            )));
        }

        if staged.len() >= limits.max_files {
            return Err(AppError::BadRequest(format!(
                "Too many files: at most {} per batch",
                limits.max_files
            )));
        }

        let temp_path = staging_dir.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));
        staged.begin(temp_path.clone());
        let size = write_field(field, &temp_path, idle).await?;

        debug!(
            "📥 Staged '{}' ({} bytes) at {}",
            original_name,
            size,
            temp_path.display()
        );
        staged.complete(original_name);
    }
    Ok(())
}

async fn write_field(mut field: Field<'_>, path: &Path, idle: Duration) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to create staging file: {}", e)))?;

    let mut size = 0u64;
    while let Some(chunk) = within(idle, field.chunk()).await? {
        file.write_all(&chunk)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write staging file: {}", e)))?;
        size += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| AppError::Internal(format!("Failed to flush staging file: {}", e)))?;
    Ok(size)
}

/// Await one multipart read, giving up once the body has been idle for `idle`.
async fn within<T>(
    idle: Duration,
    read: impl Future<Output = Result<T, MultipartError>>,
) -> Result<T, AppError> {
    tokio::time::timeout(idle, read)
        .await
        .map_err(|_| {
            AppError::RequestTimeout(format!(
                "No upload data received for {}s",
                idle.as_secs()
            ))
        })?
        .map_err(multipart_error)
}

async fn drain(multipart: &mut Multipart, idle: Duration) {
    while let Ok(Ok(Some(mut field))) = tokio::time::timeout(idle, multipart.next_field()).await {
        while let Ok(Ok(Some(_))) = tokio::time::timeout(idle, field.chunk()).await {}
    }
}

fn multipart_error(e: MultipartError) -> AppError {
    let err_msg = e.to_string();
    if err_msg.contains("length limit exceeded") {
        AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
    } else {
        AppError::BadRequest(err_msg)
    }
}
