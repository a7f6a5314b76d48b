use std::path::{Path, PathBuf};
use tracing::info;

/// Make sure the staging directory exists and return its canonical path.
pub async fn setup_staging_dir(path: &Path) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(path).await?;
    let dir = tokio::fs::canonicalize(path).await?;
    info!("📂 Staging directory: {}", dir.display());
    Ok(dir)
}
