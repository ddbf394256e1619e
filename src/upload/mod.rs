//! Upload sessions.
//!
//! `UploadManager` wires the transport, the domains manager, the record store
//! and the shared concurrency budget together. `FileUploader` runs a single
//! upload; the batch uploader reuses the same session code for many.

mod form;
mod progress;
mod recorder;
mod response;
mod resumable;
mod session;
mod sqlite_recorder;

pub use progress::ProgressCallback;
pub use recorder::{
    record_id, Block, FileRecordStore, Fingerprint, RecordStore, UploadSessionRecord,
};
pub use response::UploadResponse;
pub use session::{ResumablePolicy, StreamSource, UploadParams, UploadSource};
pub use sqlite_recorder::SqliteRecordStore;

pub(crate) use session::{run_upload, UploadOptions};

use crate::batch::BatchUploader;
use crate::config::Config;
use crate::credential::Credential;
use crate::domains::{DomainsManager, DomainsManagerBuilder};
use crate::error::{Result, UploadError};
use crate::http::{FreezePolicy, Hooks, HttpCaller, ReqwestCaller, RetryingTransport};
use crate::region::Region;
use crate::time::{system_clock, Clock};
use crate::upload_token::{UploadPolicy, UploadToken};
use crate::uplog::UploadLogger;
use bytes::Bytes;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct ManagerInner {
    config: Config,
    transport: RetryingTransport,
    records: Arc<dyn RecordStore>,
    permits: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    regions: DashMap<String, Vec<Region>>,
    auto_persist: Option<JoinHandle<()>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.auto_persist.take() {
            handle.abort();
        }
    }
}

/// Entry point for uploads. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadManager")
            .field("transport", &self.inner.transport)
            .field("available_permits", &self.inner.permits.available_permits())
            .field("cached_regions", &self.inner.regions.len())
            .finish()
    }
}

impl UploadManager {
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> UploadManagerBuilder {
        UploadManagerBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn domains(&self) -> &Arc<DomainsManager> {
        self.inner.transport.domains()
    }

    /// Permits of the shared concurrency budget not currently in use
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Starts configuring a single upload authorized by `token`
    pub fn upload_for(&self, token: UploadToken) -> FileUploader {
        FileUploader::new(self.clone(), token)
    }

    /// Starts a batch of uploads authorized by `token` unless a job brings its own
    pub fn batch_for(&self, token: UploadToken) -> BatchUploader {
        BatchUploader::new(self.clone(), token)
    }

    /// Like `upload_for`, signing a token for `policy` first
    pub fn upload_for_policy(
        &self,
        policy: UploadPolicy,
        credential: &Credential,
    ) -> Result<FileUploader> {
        Ok(self.upload_for(UploadToken::issue(policy, credential)?))
    }

    pub fn batch_for_policy(
        &self,
        policy: UploadPolicy,
        credential: &Credential,
    ) -> Result<BatchUploader> {
        Ok(self.batch_for(UploadToken::issue(policy, credential)?))
    }

    /// Token for the whole bucket, valid for the configured token lifetime
    pub fn upload_for_bucket(&self, bucket: &str, credential: &Credential) -> Result<FileUploader> {
        let token = UploadToken::for_bucket(bucket, credential, self.config())?;
        Ok(self.upload_for(token))
    }

    pub fn batch_for_bucket(&self, bucket: &str, credential: &Credential) -> Result<BatchUploader> {
        let token = UploadToken::for_bucket(bucket, credential, self.config())?;
        Ok(self.batch_for(token))
    }

    pub(crate) fn transport(&self) -> &RetryingTransport {
        &self.inner.transport
    }

    pub(crate) fn records(&self) -> &Arc<dyn RecordStore> {
        &self.inner.records
    }

    pub(crate) fn permits(&self) -> &Arc<Semaphore> {
        &self.inner.permits
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Waits for one permit of the shared budget
    pub(crate) async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| UploadError::Config("Upload concurrency budget was closed".to_string()))
    }

    /// Configured regions, or the regions the bucket lives in according to the
    /// bucket-configuration service. Falls back to `z0` when the query fails.
    pub(crate) async fn regions_for(&self, token: &UploadToken) -> Result<Vec<Region>> {
        let configured = self.inner.config.regions();
        if !configured.is_empty() {
            return Ok(configured.to_vec());
        }

        let cache_key = format!("{}:{}", token.access_key(), token.bucket());
        if let Some(regions) = self.inner.regions.get(&cache_key) {
            return Ok(regions.clone());
        }

        let queried = Region::query(
            self.inner.transport.caller().as_ref(),
            &self.inner.config.uc_url(),
            token.access_key(),
            token.bucket(),
        )
        .await;
        match queried {
            Ok(regions) if !regions.is_empty() => {
                debug!(bucket = token.bucket(), regions = regions.len(), "Bucket regions resolved");
                self.inner.regions.insert(cache_key, regions.clone());
                Ok(regions)
            }
            Ok(_) => Ok(fallback_regions()),
            Err(e) => {
                warn!(bucket = token.bucket(), error = %e, "Region query failed, using default region");
                Ok(fallback_regions())
            }
        }
    }
}

fn fallback_regions() -> Vec<Region> {
    Region::by_id("z0").into_iter().collect()
}

/// Assembles an `UploadManager`; every collaborator has a config-driven default
pub struct UploadManagerBuilder {
    config: Config,
    domains: Option<Arc<DomainsManager>>,
    caller: Option<Arc<dyn HttpCaller>>,
    records: Option<Arc<dyn RecordStore>>,
    hooks: Hooks,
    freeze_policy: Option<Arc<dyn FreezePolicy>>,
    clock: Option<Arc<dyn Clock>>,
}

impl UploadManagerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            domains: None,
            caller: None,
            records: None,
            hooks: Hooks::default(),
            freeze_policy: None,
            clock: None,
        }
    }

    /// Shares an existing domains manager instead of building one from the config
    pub fn domains(mut self, domains: Arc<DomainsManager>) -> Self {
        self.domains = Some(domains);
        self
    }

    pub fn caller(mut self, caller: Arc<dyn HttpCaller>) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn record_store(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn freeze_policy(mut self, policy: Arc<dyn FreezePolicy>) -> Self {
        self.freeze_policy = Some(policy);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<UploadManager> {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(system_clock);

        let mut auto_persist = None;
        let domains = match self.domains {
            Some(domains) => domains,
            None => {
                let domains = Arc::new(
                    DomainsManagerBuilder::from_config(&config)
                        .clock(Arc::clone(&clock))
                        .build(),
                );
                let interval = config.auto_persist_interval();
                if let Some(interval) = interval {
                    if tokio::runtime::Handle::try_current().is_ok() {
                        auto_persist = domains.spawn_auto_persist(interval);
                    }
                }
                domains
            }
        };

        let caller: Arc<dyn HttpCaller> = match self.caller {
            Some(caller) => caller,
            None => Arc::new(ReqwestCaller::with_domains(&config, Arc::clone(&domains))?),
        };
        let logger = UploadLogger::from_config(&config, Arc::clone(&caller)).map(Arc::new);

        let mut transport = RetryingTransport::new(&config, caller, domains)
            .hooks(self.hooks)
            .logger(logger);
        if let Some(policy) = self.freeze_policy {
            transport = transport.freeze_policy(policy);
        }

        let records = self
            .records
            .unwrap_or_else(|| Arc::new(FileRecordStore::new(config.record_root())));
        let permits = Arc::new(Semaphore::new(config.max_total_concurrency()));

        Ok(UploadManager {
            inner: Arc::new(ManagerInner {
                config,
                transport,
                records,
                permits,
                clock,
                regions: DashMap::new(),
                auto_persist,
            }),
        })
    }
}

/// A single upload, configured fluently and consumed by one of the `upload_*` calls
pub struct FileUploader {
    manager: UploadManager,
    token: UploadToken,
    params: UploadParams,
    options: UploadOptions,
}

impl FileUploader {
    fn new(manager: UploadManager, token: UploadToken) -> Self {
        let options = UploadOptions::new(manager.config().max_concurrency());
        Self {
            manager,
            token,
            params: UploadParams::default(),
            options,
        }
    }

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

    /// Custom variable, sent as `x:<name>`
    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.vars.push((name.into(), value.into()));
        self
    }

    /// Object metadata, sent as `x-qn-meta-<name>`
    pub fn metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.metadata.push((name.into(), value.into()));
        self
    }

    pub fn resumable_policy(mut self, policy: ResumablePolicy) -> Self {
        self.options.policy = policy;
        self
    }

    /// Size above which this upload goes chunked, instead of the configured one
    pub fn upload_threshold(mut self, threshold: u64) -> Self {
        self.options.upload_threshold = Some(threshold);
        self
    }

    pub fn enable_checksum(mut self) -> Self {
        self.options.checksum = true;
        self
    }

    /// Skips comparing block checksums and the returned content hash
    pub fn disable_checksum(mut self) -> Self {
        self.options.checksum = false;
        self
    }

    /// Block uploads in flight for this upload, at least 1
    pub fn max_concurrency(mut self, concurrency: usize) -> Self {
        self.options.max_concurrency = concurrency.max(1);
        self
    }

    /// Called with `(uploaded, total)`; total is 0 while a stream's size is unknown
    pub fn on_progress(mut self, callback: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.options.on_progress = Some(Arc::new(callback));
        self
    }

    pub async fn upload_file(self, path: impl AsRef<Path>) -> Result<UploadResponse> {
        let source = UploadSource::File(path.as_ref().to_path_buf());
        self.upload(source).await
    }

    pub async fn upload_bytes(self, data: impl Into<Bytes>) -> Result<UploadResponse> {
        self.upload(UploadSource::Bytes(data.into())).await
    }

    /// Reads `reader` to its end; the size is learned as blocks are cut
    pub async fn upload_stream(
        self,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<UploadResponse> {
        self.upload(UploadSource::Stream(StreamSource::new(reader)))
            .await
    }

    async fn upload(self, source: UploadSource) -> Result<UploadResponse> {
        let _permit = self.manager.acquire_permit().await?;
        run_upload(
            &self.manager,
            &self.token,
            &self.params,
            &source,
            self.options,
        )
        .await
    }
}
