use crate::models::{ArchiveEntry, UploadedFile};
use crate::services::error::ProcessingError;
use crate::services::temp_upload::TempUpload;
use crate::services::watermark::ImageProcessor;
use bytes::Bytes;
use futures::Stream;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// File name offered to the client for the generated archive.
pub const ARCHIVE_FILE_NAME: &str = "archive.zip";

/// Chunks buffered between the archiver and the response body.
const CHANNEL_CAPACITY: usize = 4;

/// Fixed part of a ZIP local file header; the entry name follows it.
const LOCAL_HEADER_FIXED_LEN: u64 = 30;

pub type ArchiveChunk = Result<Bytes, ProcessingError>;

#[derive(Debug, Default)]
struct SpoolBuffer {
    pending: Vec<u8>,
    /// Absolute archive offset of `pending[0]`.
    base: u64,
    cursor: u64,
}

impl SpoolBuffer {
    fn end(&self) -> u64 {
        self.base + self.pending.len() as u64
    }
}

/// Seekable sink for [`ZipWriter`] that can hand finished bytes downstream.
///
/// The ZIP writer patches each local header (CRC and sizes) once the entry
/// data is complete, so bytes stay in the spool until the caller commits
/// them. Committed bytes are gone; seeking back into them is an error.
#[derive(Debug, Clone, Default)]
pub struct ArchiveSpool {
    inner: Arc<Mutex<SpoolBuffer>>,
}

impl ArchiveSpool {
    fn lock(&self) -> MutexGuard<'_, SpoolBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total bytes written so far, committed or not.
    pub fn len(&self) -> u64 {
        self.lock().end()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every pending byte before `offset`.
    pub fn commit(&self, offset: u64) -> Option<Bytes> {
        let mut buf = self.lock();
        let upto = offset.clamp(buf.base, buf.end());
        let count = (upto - buf.base) as usize;
        if count == 0 {
            return None;
        }
        let chunk: Vec<u8> = buf.pending.drain(..count).collect();
        buf.base = upto;
        Some(Bytes::from(chunk))
    }

    /// Take everything still pending.
    pub fn commit_all(&self) -> Option<Bytes> {
        let end = self.len();
        self.commit(end)
    }
}

impl Write for ArchiveSpool {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self.lock();
        let start = (buf.cursor - buf.base) as usize;
        let overlap = buf.pending.len().saturating_sub(start).min(data.len());
        buf.pending[start..start + overlap].copy_from_slice(&data[..overlap]);
        buf.pending.extend_from_slice(&data[overlap..]);
        buf.cursor += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ArchiveSpool {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut buf = self.lock();
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => buf.cursor.checked_add_signed(delta),
            SeekFrom::End(delta) => buf.end().checked_add_signed(delta),
        };
        match target {
            Some(target) if target >= buf.base && target <= buf.end() => {
                buf.cursor = target;
                Ok(target)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside the uncommitted part of the archive",
            )),
        }
    }
}

/// Receiving end of one batch: archive chunks in order, or the error that aborted it.
pub struct ArchiveStream {
    rx: mpsc::Receiver<ArchiveChunk>,
    idle: Option<Duration>,
}

impl ArchiveStream {
    /// Fail the stream when the archiver produces nothing for `idle`.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = Some(idle);
        self
    }

    pub async fn next_chunk(&mut self) -> Option<ArchiveChunk> {
        let Some(idle) = self.idle else {
            return self.rx.recv().await;
        };
        match tokio::time::timeout(idle, self.rx.recv()).await {
            Ok(chunk) => chunk,
            Err(_) => Some(Err(ProcessingError::Stream(format!(
                "no archive output for {}s",
                idle.as_secs()
            )))),
        }
    }

    /// Drain the whole archive, failing if the batch was aborted.
    pub async fn collect(mut self) -> Result<Vec<u8>, ProcessingError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Body stream that yields `first` and then the remaining chunks, ending
    /// after the first error.
    pub fn into_body_stream(
        mut self,
        first: Bytes,
    ) -> impl Stream<Item = ArchiveChunk> + Send + 'static {
        async_stream::stream! {
            yield Ok(first);
            while let Some(chunk) = self.next_chunk().await {
                let failed = chunk.is_err();
                yield chunk;
                if failed {
                    break;
                }
            }
        }
    }
}

/// Watermarks an ordered batch of uploads into one streamed ZIP archive.
#[derive(Clone)]
pub struct BatchArchiver {
    processor: Arc<dyn ImageProcessor>,
}

impl BatchArchiver {
    pub fn new(processor: Arc<dyn ImageProcessor>) -> Self {
        Self { processor }
    }

    /// Start processing `files` in a background task and return the archive stream.
    pub fn run(&self, files: Vec<UploadedFile>) -> ArchiveStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let archiver = self.clone();
        tokio::spawn(async move {
            if let Err(e) = archiver.stream_into(files, &tx).await {
                if e.is_stream() {
                    warn!("📦 Archive stream abandoned: {}", e);
                } else {
                    error!("📦 Batch aborted: {}", e);
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        ArchiveStream { rx, idle: None }
    }

    /// Process every file in order, sending archive bytes to `tx` as they become final.
    ///
    /// Files are claimed one at a time. On error the failing file is still
    /// released, while files that were never started are left untouched.
    pub async fn stream_into(
        &self,
        files: Vec<UploadedFile>,
        tx: &mpsc::Sender<ArchiveChunk>,
    ) -> Result<(), ProcessingError> {
        let total = files.len();
        info!("📦 Building archive from {} file(s)", total);

        let spool = ArchiveSpool::default();
        let mut zip = ZipWriter::new(spool.clone());

        for (index, file) in files.into_iter().enumerate() {
            if tx.is_closed() {
                return Err(ProcessingError::Stream(format!(
                    "client disconnected before file {} of {}",
                    index + 1,
                    total
                )));
            }

            let upload = TempUpload::claim(file);
            let name = upload.original_name().to_string();
            let outcome = self.append(zip, &upload, &spool, tx).await;
            // Cleanup failures are already logged and never abort the batch.
            let _ = upload.release().await;
            zip = outcome.map_err(|e| e.for_file(&name))?;
            debug!("Added '{}' ({} of {}) to archive", name, index + 1, total);
        }

        tokio::task::spawn_blocking(move || zip.finish()).await??;
        if let Some(tail) = spool.commit_all() {
            send(tx, tail).await?;
        }

        info!("✅ Archive complete: {} file(s), {} bytes", total, spool.len());
        Ok(())
    }

    /// Watermark one upload and write it as the next archive member.
    async fn append(
        &self,
        mut zip: ZipWriter<ArchiveSpool>,
        upload: &TempUpload,
        spool: &ArchiveSpool,
        tx: &mpsc::Sender<ArchiveChunk>,
    ) -> Result<ZipWriter<ArchiveSpool>, ProcessingError> {
        let bytes = upload.read().await?;

        let processor = self.processor.clone();
        let content = tokio::task::spawn_blocking(move || processor.process(&bytes)).await??;
        let entry = ArchiveEntry {
            name: upload.archive_name(),
            content,
        };
        let member_start = spool.clone();

        let (zip, final_upto) = tokio::task::spawn_blocking(move || -> Result<_, ProcessingError> {
            let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
            zip.start_file(entry.name.as_str(), options)?;
            // Starting this member finalised the previous one. Everything
            // before the new local header is now immutable.
            let header_len = LOCAL_HEADER_FIXED_LEN + entry.name.len() as u64;
            let final_upto = member_start.len().saturating_sub(header_len);
            zip.write_all(&entry.content)?;
            Ok((zip, final_upto))
        })
        .await??;

        if let Some(chunk) = spool.commit(final_upto) {
            send(tx, chunk).await?;
        }
        Ok(zip)
    }
}

async fn send(tx: &mpsc::Sender<ArchiveChunk>, chunk: Bytes) -> Result<(), ProcessingError> {
    tx.send(Ok(chunk))
        .await
        .map_err(|_| ProcessingError::Stream("client disconnected".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spool_overwrites_in_place() {
        let mut spool = ArchiveSpool::default();
        spool.write_all(b"hello world").unwrap();
        spool.seek(SeekFrom::Start(6)).unwrap();
        spool.write_all(b"WORLD").unwrap();
        assert_eq!(spool.seek(SeekFrom::Current(0)).unwrap(), 11);
        assert_eq!(spool.commit_all().unwrap(), Bytes::from_static(b"hello WORLD"));
    }

    #[test]
    fn test_spool_extends_past_end_after_overwrite() {
        let mut spool = ArchiveSpool::default();
        spool.write_all(b"abc").unwrap();
        spool.seek(SeekFrom::Start(1)).unwrap();
        spool.write_all(b"XYZ").unwrap();
        assert_eq!(spool.commit_all().unwrap(), Bytes::from_static(b"aXYZ"));
    }

    #[test]
    fn test_spool_rejects_seek_into_committed_bytes() {
        let mut spool = ArchiveSpool::default();
        spool.write_all(b"0123456789").unwrap();
        assert_eq!(spool.commit(4).unwrap(), Bytes::from_static(b"0123"));
        assert!(spool.seek(SeekFrom::Start(2)).is_err());
        assert!(spool.seek(SeekFrom::End(1)).is_err());
        assert_eq!(spool.seek(SeekFrom::Start(4)).unwrap(), 4);
        spool.write_all(b"ab").unwrap();
        assert_eq!(spool.len(), 10);
        assert_eq!(spool.commit_all().unwrap(), Bytes::from_static(b"ab6789"));
    }

    #[test]
    fn test_spool_commit_is_clamped() {
        let mut spool = ArchiveSpool::default();
        assert!(spool.commit_all().is_none());
        spool.write_all(b"xyz").unwrap();
        assert!(spool.commit(0).is_none());
        assert_eq!(spool.commit(100).unwrap(), Bytes::from_static(b"xyz"));
        assert!(!spool.is_empty());
    }

    #[test]
    fn test_zip_writer_over_spool_with_incremental_commits() {
        let spool = ArchiveSpool::default();
        let mut zip = ZipWriter::new(spool.clone());
        let mut streamed = Vec::new();
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        for (name, body) in [("one.jpg", b"first body".as_slice()), ("two.jpg", b"second")] {
            zip.start_file(name, options).unwrap();
            let header_len = LOCAL_HEADER_FIXED_LEN + name.len() as u64;
            let final_upto = spool.len() - header_len;
            zip.write_all(body).unwrap();
            if let Some(chunk) = spool.commit(final_upto) {
                streamed.extend_from_slice(&chunk);
            }
        }
        zip.finish().unwrap();
        streamed.extend_from_slice(&spool.commit_all().unwrap());

        let mut archive = zip::ZipArchive::new(io::Cursor::new(streamed)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut content = String::new();
        io::Read::read_to_string(&mut archive.by_name("two.jpg").unwrap(), &mut content).unwrap();
        assert_eq!(content, "second");
    }

    struct StallingProcessor;

    impl ImageProcessor for StallingProcessor {
        fn process(&self, image: &[u8]) -> Result<Vec<u8>, ProcessingError> {
            std::thread::sleep(std::time::Duration::from_millis(500));
            Ok(image.to_vec())
        }
    }

    #[tokio::test]
    async fn test_idle_archive_stream_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".upload-slow");
        std::fs::write(&path, b"slow").unwrap();

        let archiver = BatchArchiver::new(Arc::new(StallingProcessor));
        let err = archiver
            .run(vec![UploadedFile::new("slow.png", path)])
            .with_idle_timeout(Duration::from_millis(50))
            .collect()
            .await
            .unwrap_err();
        assert!(err.is_stream());
    }
}
