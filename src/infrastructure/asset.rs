use crate::services::watermark::WatermarkAsset;
use std::path::Path;
use std::sync::Arc;

/// Load the watermark once. Any failure here must stop the service from starting.
pub async fn setup_watermark(path: &Path) -> anyhow::Result<Arc<WatermarkAsset>> {
    let asset = WatermarkAsset::load(path).await.map_err(|e| {
        tracing::error!("❌ Refusing to start: {}", e);
        anyhow::anyhow!(e)
    })?;
    Ok(Arc::new(asset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_asset_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = setup_watermark(&dir.path().join("missing.svg"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Watermark asset unavailable"));
    }

    #[tokio::test]
    async fn test_corrupt_asset_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.svg");
        std::fs::write(&path, b"<svg").unwrap();
        assert!(setup_watermark(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_valid_asset_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mark.svg");
        std::fs::write(
            &path,
            br#"<svg xmlns="http://www.w3.org/2000/svg" width="20" height="10"><rect width="20" height="10"/></svg>"#,
        )
        .unwrap();
        let asset = setup_watermark(&path).await.unwrap();
        assert_eq!(asset.aspect_ratio(), 2.0);
    }
}
