use thiserror::Error;

/// Failures raised while turning uploads into a watermarked archive.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Image could not be decoded: {0}")]
    Decode(String),

    #[error("Watermark asset unavailable: {0}")]
    Asset(String),

    #[error("JPEG encoding failed: {0}")]
    Encode(String),

    #[error("Temp file cleanup failed: {0}")]
    Cleanup(String),

    #[error("Archive stream closed: {0}")]
    Stream(String),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Failed to process '{file}': {source}")]
    Item {
        file: String,
        #[source]
        source: Box<ProcessingError>,
    },
}

impl ProcessingError {
    /// Attach the name of the upload being processed.
    pub fn for_file(self, file: &str) -> Self {
        match self {
            // Stream errors describe the client, not the file.
            ProcessingError::Stream(_) | ProcessingError::Item { .. } => self,
            other => ProcessingError::Item {
                file: file.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_decode(&self) -> bool {
        match self {
            ProcessingError::Decode(_) => true,
            ProcessingError::Item { source, .. } => source.is_decode(),
            _ => false,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, ProcessingError::Stream(_))
    }
}
