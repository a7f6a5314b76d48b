use crate::services::upload_collector::STAGING_PREFIX;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::sleep;

/// Removes staged uploads nobody claimed, e.g. the files after a failed
/// item in an aborted batch.
pub struct StagingSweeper {
    staging_dir: PathBuf,
    max_age: Duration,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl StagingSweeper {
    pub fn new(
        staging_dir: PathBuf,
        max_age: Duration,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            staging_dir,
            max_age,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Staging sweeper started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Staging sweeper shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.sweep_once().await;
                }
            }
        }
    }

    /// Delete staged files older than `max_age`; returns how many were removed.
    pub async fn sweep_once(&self) -> usize {
        tracing::info!("🧹 Sweeping stale uploads in {}", self.staging_dir.display());

        let mut entries = match tokio::fs::read_dir(&self.staging_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(
                    "Failed to read staging dir {}: {}",
                    self.staging_dir.display(),
                    e
                );
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if !metadata.is_file() || age < self.max_age {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(
                    "Failed to remove stale upload {}: {}",
                    entry.path().display(),
                    e
                ),
            }
        }

        tracing::info!("✅ Staging sweep removed {} file(s)", removed);
        removed
    }
}
