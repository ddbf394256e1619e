use super::progress::{ProgressCallback, ProgressTracker};
use super::{form, resumable, UploadManager, UploadResponse};
use crate::error::{ErrorContext, Result, UploadError};
use crate::region::Region;
use crate::upload_token::UploadToken;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::info;

/// Whether an upload goes through the chunked protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumablePolicy {
    /// Chunked only above the configured upload threshold
    #[default]
    Threshold,
    Always,
    Never,
}

impl ResumablePolicy {
    pub fn is_chunked(self, size: u64, threshold: u64) -> bool {
        match self {
            ResumablePolicy::Threshold => size > threshold,
            ResumablePolicy::Always => true,
            ResumablePolicy::Never => false,
        }
    }
}

/// A reader consumed front to back whose size is not known up front
#[derive(Clone)]
pub struct StreamSource {
    reader: Arc<Mutex<Box<dyn AsyncRead + Send + Unpin>>>,
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource").finish_non_exhaustive()
    }
}

impl StreamSource {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Arc::new(Mutex::new(Box::new(reader))),
        }
    }

    /// Next `len` bytes; shorter only at the end of the stream
    pub(crate) async fn read_block(&self, len: u64) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        let mut buffer = Vec::with_capacity(len as usize);
        (&mut *reader)
            .take(len)
            .read_to_end(&mut buffer)
            .await
            .context("Failed to read upload stream")?;
        Ok(Bytes::from(buffer))
    }

    pub(crate) async fn read_to_end(&self) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        let mut buffer = Vec::new();
        reader
            .read_to_end(&mut buffer)
            .await
            .context("Failed to read upload stream")?;
        Ok(Bytes::from(buffer))
    }
}

/// Where the object content comes from
#[derive(Debug, Clone)]
pub enum UploadSource {
    File(PathBuf),
    Bytes(Bytes),
    Stream(StreamSource),
}

impl UploadSource {
    /// `None` for streams
    pub fn size(&self) -> Result<Option<u64>> {
        match self {
            UploadSource::File(path) => Ok(Some(
                std::fs::metadata(path)
                    .context("Failed to stat upload source")?
                    .len(),
            )),
            UploadSource::Bytes(data) => Ok(Some(data.len() as u64)),
            UploadSource::Stream(_) => Ok(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            UploadSource::File(path) => Some(path),
            UploadSource::Bytes(_) | UploadSource::Stream(_) => None,
        }
    }

    pub(crate) async fn read_all(&self) -> Result<Bytes> {
        match self {
            UploadSource::File(path) => Ok(Bytes::from(
                tokio::fs::read(path)
                    .await
                    .context("Failed to read upload source")?,
            )),
            UploadSource::Bytes(data) => Ok(data.clone()),
            UploadSource::Stream(stream) => stream.read_to_end().await,
        }
    }

    /// Reads exactly `len` bytes at `offset`; less data is an integrity error
    pub(crate) async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        match self {
            UploadSource::File(path) => {
                let mut file = tokio::fs::File::open(path)
                    .await
                    .context("Failed to open upload source")?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buffer = Vec::with_capacity(len as usize);
                file.take(len).read_to_end(&mut buffer).await?;
                if (buffer.len() as u64) < len {
                    return Err(short_read(offset, len, buffer.len() as u64));
                }
                Ok(Bytes::from(buffer))
            }
            UploadSource::Bytes(data) => {
                let start = (offset as usize).min(data.len());
                let end = (offset.saturating_add(len) as usize).min(data.len());
                if ((end - start) as u64) < len {
                    return Err(short_read(offset, len, (end - start) as u64));
                }
                Ok(data.slice(start..end))
            }
            UploadSource::Stream(_) => Err(UploadError::Integrity(
                "Streams can only be read front to back".to_string(),
            )),
        }
    }
}

fn short_read(offset: u64, expected: u64, got: u64) -> UploadError {
    UploadError::Integrity(format!(
        "Short read at offset {}: expected {} bytes, got {}",
        offset, expected, got
    ))
}

/// Object-level options shared by single uploads and batch jobs
#[derive(Debug, Clone, Default)]
pub struct UploadParams {
    pub key: Option<String>,
    pub file_name: Option<String>,
    pub mime: Option<String>,
    /// Custom variables, names without the `x:` prefix
    pub vars: Vec<(String, String)>,
    /// Object metadata, names without the `x-qn-meta-` prefix
    pub metadata: Vec<(String, String)>,
}

impl UploadParams {
    pub(crate) fn file_name_for(&self, source: &UploadSource) -> String {
        self.file_name
            .clone()
            .or_else(|| {
                source
                    .path()
                    .and_then(Path::file_name)
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .or_else(|| self.key.clone())
            .unwrap_or_else(|| "untitled".to_string())
    }
}

/// Per-upload knobs, resolved from the uploader or batch job
#[derive(Clone)]
pub(crate) struct UploadOptions {
    pub policy: ResumablePolicy,
    /// Overrides the configured upload threshold
    pub upload_threshold: Option<u64>,
    /// Verify block checksums and the returned content hash
    pub checksum: bool,
    pub max_concurrency: usize,
    pub on_progress: Option<ProgressCallback>,
}

impl UploadOptions {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            policy: ResumablePolicy::default(),
            upload_threshold: None,
            checksum: true,
            max_concurrency,
            on_progress: None,
        }
    }

    /// Streams of unknown size are chunked unless the policy forbids it
    fn is_chunked(&self, size: Option<u64>, configured_threshold: u64) -> bool {
        match size {
            Some(size) => self
                .policy
                .is_chunked(size, self.upload_threshold.unwrap_or(configured_threshold)),
            None => self.policy != ResumablePolicy::Never,
        }
    }
}

/// Everything one upload needs while it runs
pub(crate) struct UploadSession<'a> {
    pub manager: &'a UploadManager,
    pub token: &'a UploadToken,
    pub regions: &'a [Region],
    pub params: &'a UploadParams,
    pub source: &'a UploadSource,
    /// `None` until a stream has been read to its end
    pub size: Option<u64>,
    pub progress: &'a ProgressTracker,
    pub max_concurrency: usize,
    pub checksum: bool,
}

/// Runs one upload, picking direct or chunked by size and policy.
/// The caller holds the job's permit of the shared concurrency budget.
pub(crate) async fn run_upload(
    manager: &UploadManager,
    token: &UploadToken,
    params: &UploadParams,
    source: &UploadSource,
    options: UploadOptions,
) -> Result<UploadResponse> {
    let size = source.size()?;
    let regions = manager.regions_for(token).await?;
    let progress = ProgressTracker::new(size, options.on_progress.clone());
    let chunked = options.is_chunked(size, manager.config().upload_threshold());

    info!(
        bucket = token.bucket(),
        key = params.key.as_deref().unwrap_or_default(),
        size = ?size,
        chunked = chunked,
        "Starting upload"
    );

    let session = UploadSession {
        manager,
        token,
        regions: &regions,
        params,
        source,
        size,
        progress: &progress,
        max_concurrency: options.max_concurrency.max(1),
        checksum: options.checksum,
    };
    let response = if chunked {
        resumable::upload(&session).await?
    } else {
        form::upload(&session).await?
    };
    progress.finish();

    info!(
        bucket = token.bucket(),
        key = response.key().unwrap_or_default(),
        hash = response.hash().unwrap_or_default(),
        "Upload finished"
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_decision() {
        let threshold = 4 << 20;
        assert!(!ResumablePolicy::Threshold.is_chunked(threshold, threshold));
        assert!(ResumablePolicy::Threshold.is_chunked(threshold + 1, threshold));
        assert!(ResumablePolicy::Always.is_chunked(1, threshold));
        assert!(!ResumablePolicy::Never.is_chunked(threshold * 10, threshold));
    }

    #[tokio::test]
    async fn test_read_range_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let source = UploadSource::File(path);

        assert_eq!(source.size().unwrap(), Some(10));
        assert_eq!(&source.read_range(4, 3).await.unwrap()[..], b"456");
        let err = source.read_range(8, 4).await.unwrap_err();
        assert!(matches!(err, UploadError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_read_range_from_bytes() {
        let source = UploadSource::Bytes(Bytes::from_static(b"abcdef"));
        assert_eq!(&source.read_range(0, 6).await.unwrap()[..], b"abcdef");
        assert!(source.read_range(5, 2).await.is_err());
        assert!(source.read_range(10, 1).await.is_err());
    }

    #[test]
    fn test_file_name_fallbacks() {
        let mut params = UploadParams::default();
        let bytes = UploadSource::Bytes(Bytes::new());
        assert_eq!(params.file_name_for(&bytes), "untitled");

        params.key = Some("dir/key.txt".to_string());
        assert_eq!(params.file_name_for(&bytes), "dir/key.txt");
        let file = UploadSource::File(PathBuf::from("/tmp/report.pdf"));
        assert_eq!(params.file_name_for(&file), "report.pdf");

        params.file_name = Some("custom.bin".to_string());
        assert_eq!(params.file_name_for(&file), "custom.bin");
    }

    #[test]
    fn test_threshold_override_and_unknown_size() {
        let mut options = UploadOptions::new(1);
        assert!(!options.is_chunked(Some(100), 4 << 20));
        options.upload_threshold = Some(64);
        assert!(options.is_chunked(Some(100), 4 << 20));

        assert!(options.is_chunked(None, 4 << 20));
        options.policy = ResumablePolicy::Never;
        assert!(!options.is_chunked(None, 4 << 20));
    }

    #[tokio::test]
    async fn test_stream_reads_blocks_in_order() {
        let stream = StreamSource::new(std::io::Cursor::new(b"0123456789".to_vec()));
        let source = UploadSource::Stream(stream.clone());
        assert_eq!(source.size().unwrap(), None);

        assert_eq!(&stream.read_block(4).await.unwrap()[..], b"0123");
        assert_eq!(&stream.read_block(4).await.unwrap()[..], b"4567");
        assert_eq!(&stream.read_block(4).await.unwrap()[..], b"89");
        assert!(stream.read_block(4).await.unwrap().is_empty());
        assert!(source.read_range(0, 1).await.is_err());
    }
}
