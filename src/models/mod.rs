use serde::Serialize;
use std::path::PathBuf;
use utoipa::ToSchema;

/// A file staged by the upload collector and handed to the archiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub original_name: String,
    pub temp_path: PathBuf,
}

impl UploadedFile {
    pub fn new(original_name: impl Into<String>, temp_path: impl Into<PathBuf>) -> Self {
        Self {
            original_name: original_name.into(),
            temp_path: temp_path.into(),
        }
    }

    /// Archive member name: the original name with its extension replaced by `.jpg`.
    ///
    /// Only the last path segment is inspected for an extension, and a leading
    /// dot (`.hidden`) is not treated as one. Names are never deduplicated.
    ///
    /// Two uploads with the same stem become two archive members with the
    /// same name, since an already streamed member cannot be replaced. Readers
    /// that look members up by name get the later one; `unzip` asks which
    /// to keep.
    pub fn archive_name(&self) -> String {
        let name = self.original_name.as_str();
        let segment_start = name.rfind(|c| c == '/' || c == '\\').map_or(0, |i| i + 1);
        let stem = match name[segment_start..].rfind('.') {
            None | Some(0) => name,
            Some(dot) => &name[..segment_start + dot],
        };
        format!("{stem}.jpg")
    }
}

/// One member of the outgoing archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}
