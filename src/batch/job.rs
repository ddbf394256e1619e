use crate::credential::Credential;
use crate::error::Result;
use crate::upload::{
    ProgressCallback, ResumablePolicy, StreamSource, UploadParams, UploadResponse, UploadSource,
};
use crate::upload_token::{UploadPolicy, UploadToken};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Invoked exactly once with the outcome of a job
pub type CompletionCallback = Box<dyn FnOnce(Result<UploadResponse>) + Send>;

/// One queued upload
pub struct BatchJob {
    pub(crate) source: UploadSource,
    pub(crate) params: UploadParams,
    pub(crate) token: Option<UploadToken>,
    pub(crate) resumable_policy: Option<ResumablePolicy>,
    pub(crate) upload_threshold: Option<u64>,
    pub(crate) checksum: bool,
    pub(crate) on_progress: Option<ProgressCallback>,
    pub(crate) on_completed: Option<CompletionCallback>,
}

impl std::fmt::Debug for BatchJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchJob")
            .field("source", &self.source)
            .field("key", &self.params.key)
            .field("has_token", &self.token.is_some())
            .field("resumable_policy", &self.resumable_policy)
            .field("upload_threshold", &self.upload_threshold)
            .field("checksum", &self.checksum)
            .finish()
    }
}

impl BatchJob {
    pub fn builder() -> BatchJobBuilder {
        BatchJobBuilder::default()
    }

    pub fn source(&self) -> &UploadSource {
        &self.source
    }

    pub fn key(&self) -> Option<&str> {
        self.params.key.as_deref()
    }
}

pub struct BatchJobBuilder {
    params: UploadParams,
    token: Option<UploadToken>,
    resumable_policy: Option<ResumablePolicy>,
    upload_threshold: Option<u64>,
    checksum: bool,
    on_progress: Option<ProgressCallback>,
    on_completed: Option<CompletionCallback>,
}

impl Default for BatchJobBuilder {
    fn default() -> Self {
        Self {
            params: UploadParams::default(),
            token: None,
            resumable_policy: None,
            upload_threshold: None,
            checksum: true,
            on_progress: None,
            on_completed: None,
        }
    }
}

impl BatchJobBuilder {
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.params.key = Some(key.into());
        self
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.params.file_name = Some(file_name.into());
        self
    }

    pub fn mime(mut self, mime: impl Into<String>) -> Self {
        self.params.mime = Some(mime.into());
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.vars.push((name.into(), value.into()));
        self
    }

    pub fn metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.metadata.push((name.into(), value.into()));
        self
    }

    /// Overrides the batch-wide token for this job only
    pub fn upload_token(mut self, token: UploadToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Signs a token for `policy` and uses it for this job only
    pub fn upload_policy(self, policy: UploadPolicy, credential: &Credential) -> Result<Self> {
        Ok(self.upload_token(UploadToken::issue(policy, credential)?))
    }

    pub fn resumable_policy(mut self, policy: ResumablePolicy) -> Self {
        self.resumable_policy = Some(policy);
        self
    }

    pub fn upload_threshold(mut self, threshold: u64) -> Self {
        self.upload_threshold = Some(threshold);
        self
    }

    pub fn enable_checksum(mut self) -> Self {
        self.checksum = true;
        self
    }

    pub fn disable_checksum(mut self) -> Self {
        self.checksum = false;
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_completed(
        mut self,
        callback: impl FnOnce(Result<UploadResponse>) + Send + 'static,
    ) -> Self {
        self.on_completed = Some(Box::new(callback));
        self
    }

    pub fn upload_file(self, path: impl AsRef<Path>) -> BatchJob {
        self.into_job(UploadSource::File(path.as_ref().to_path_buf()))
    }

    pub fn upload_bytes(self, data: impl Into<Bytes>) -> BatchJob {
        self.into_job(UploadSource::Bytes(data.into()))
    }

    pub fn upload_stream(self, reader: impl AsyncRead + Send + Unpin + 'static) -> BatchJob {
        self.into_job(UploadSource::Stream(StreamSource::new(reader)))
    }

    fn into_job(self, source: UploadSource) -> BatchJob {
        BatchJob {
            source,
            params: self.params,
            token: self.token,
            resumable_policy: self.resumable_policy,
            upload_threshold: self.upload_threshold,
            checksum: self.checksum,
            on_progress: self.on_progress,
            on_completed: self.on_completed,
        }
    }
}
