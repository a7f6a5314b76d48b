use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the watermark service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding staged uploads (default: "tmp")
    pub staging_dir: PathBuf,

    /// SVG watermark composited onto every image (default: "watermark.svg")
    pub watermark_path: PathBuf,

    /// Multipart field carrying the images (default: "images")
    pub upload_field: String,

    /// Maximum number of files per batch (default: 50)
    pub max_files: usize,

    /// Maximum request body size in bytes (default: 512 MB)
    pub max_upload_size: usize,

    /// How long a batch may go without progress, while reading the upload
    /// or while waiting for archive output (default: 120 s)
    pub processing_timeout_secs: u64,

    /// JPEG quality of the re-encoded images, 1-100 (default: 80)
    pub jpeg_quality: u8,

    /// Staged files older than this are swept (default: 24)
    pub staging_cleanup_age_hours: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("tmp"),
            watermark_path: PathBuf::from("watermark.svg"),
            upload_field: "images".to_string(),
            max_files: 50,
            max_upload_size: 512 * 1024 * 1024, // 512 MB
            processing_timeout_secs: 2 * 60,
            jpeg_quality: 80,
            staging_cleanup_age_hours: 24,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            staging_dir: env::var("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.staging_dir),

            watermark_path: env::var("WATERMARK_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.watermark_path),

            upload_field: default.upload_field,

            max_files: env::var("MAX_FILES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default.max_files),

            max_upload_size: env::var("MAX_UPLOAD_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_upload_size),

            processing_timeout_secs: env::var("PROCESSING_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default.processing_timeout_secs),

            jpeg_quality: env::var("JPEG_QUALITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| (1..=100).contains(v))
                .unwrap_or(default.jpeg_quality),

            staging_cleanup_age_hours: env::var("STAGING_CLEANUP_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.staging_cleanup_age_hours),
        }
    }

    /// Create config for development (small batches, short timeouts)
    pub fn development() -> Self {
        Self {
            max_files: 10,
            max_upload_size: 64 * 1024 * 1024,
            processing_timeout_secs: 30,
            staging_cleanup_age_hours: 1,
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn staging_cleanup_age(&self) -> Duration {
        Duration::from_secs(self.staging_cleanup_age_hours * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.max_files, 50);
        assert_eq!(config.upload_field, "images");
        assert_eq!(config.jpeg_quality, 80);
        assert_eq!(config.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.staging_dir, PathBuf::from("tmp"));
    }

    #[test]
    fn test_development_config() {
        let config = ServiceConfig::development();
        assert_eq!(config.max_files, 10);
        assert_eq!(config.processing_timeout_secs, 30);
        assert_eq!(config.watermark_path, PathBuf::from("watermark.svg"));
        assert_eq!(config.staging_cleanup_age(), Duration::from_secs(3600));
    }
}
