//! Upload log.
//!
//! Every exchange the transport performs is appended as a JSON line to a local
//! file. Once the file grows past a threshold a background task ships its
//! content to the uplog service and cuts the shipped lines off the file.
//! Nothing in here may fail an upload: errors are logged and dropped.
//!
//! File locks are only ever taken on blocking threads and never held across
//! an await.

mod record;

pub use record::{UpType, UplogRecord};

use crate::config::Config;
use crate::error::Result;
use crate::http::{Body, HttpCaller, Method, Request};
use crate::upload_token::UploadToken;
use bytes::Bytes;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How the log file is shared between writers, possibly across processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// No file locking at all
    None,
    /// Appends share the lock; shipping the file takes it exclusively
    #[default]
    SharedAppendExclusiveUpload,
    /// Every access takes the lock exclusively
    AlwaysExclusive,
}

pub struct UploadLogger {
    path: PathBuf,
    uplog_url: String,
    lock_policy: LockPolicy,
    max_size: u64,
    upload_threshold: u64,
    caller: Arc<dyn HttpCaller>,
    /// Set while a shipping task of this logger is running
    shipping: AtomicBool,
}

impl std::fmt::Debug for UploadLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadLogger")
            .field("path", &self.path)
            .field("uplog_url", &self.uplog_url)
            .field("lock_policy", &self.lock_policy)
            .field("max_size", &self.max_size)
            .field("upload_threshold", &self.upload_threshold)
            .field("shipping", &self.shipping.load(Ordering::Relaxed))
            .finish()
    }
}

impl UploadLogger {
    pub fn new(path: impl Into<PathBuf>, uplog_url: impl Into<String>, caller: Arc<dyn HttpCaller>) -> Self {
        Self {
            path: path.into(),
            uplog_url: uplog_url.into(),
            lock_policy: LockPolicy::default(),
            max_size: 1 << 22,
            upload_threshold: 1 << 12,
            caller,
            shipping: AtomicBool::new(false),
        }
    }

    /// `None` when the upload log is disabled
    pub fn from_config(config: &Config, caller: Arc<dyn HttpCaller>) -> Option<Self> {
        if !config.uplog_enabled() {
            return None;
        }
        Some(
            Self::new(config.uplog_path(), config.uplog_url(), caller)
                .lock_policy(config.uplog_lock_policy())
                .max_size(config.uplog_max_size())
                .upload_threshold(config.uplog_upload_threshold()),
        )
    }

    pub fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn max_size(mut self, size: u64) -> Self {
        self.max_size = size;
        self
    }

    pub fn upload_threshold(mut self, threshold: u64) -> Self {
        self.upload_threshold = threshold;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `record`, then starts shipping in the background when the file
    /// grew large enough and no shipping task is running yet. Returns that
    /// task's handle; dropping it leaves the task running.
    ///
    /// Shipping needs a token; without one the file just keeps growing up to `max_size`.
    pub async fn log(
        self: &Arc<Self>,
        record: &UplogRecord,
        token: Option<&UploadToken>,
    ) -> Option<JoinHandle<()>> {
        let line = match record.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode upload log record");
                return None;
            }
        };
        let logger = Arc::clone(self);
        let size = match blocking(move || logger.append(&line)).await {
            Ok(size) => size,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to write upload log");
                return None;
            }
        };

        if size <= self.upload_threshold {
            return None;
        }
        let token = token?.clone();
        if self.shipping.swap(true, Ordering::AcqRel) {
            return None;
        }
        let logger = Arc::clone(self);
        Some(tokio::spawn(async move {
            if let Err(e) = logger.flush(&token).await {
                warn!(url = %logger.uplog_url, error = %e, "Failed to ship upload log");
            }
            logger.shipping.store(false, Ordering::Release);
        }))
    }

    /// Returns the file size after the append
    fn append(&self, line: &str) -> Result<u64> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        self.lock(&file, false)?;
        let result = (|| -> Result<u64> {
            let size = file.metadata()?.len();
            if size >= self.max_size {
                debug!(size = size, "Upload log full, dropping record");
                return Ok(size);
            }
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
            Ok(size + line.len() as u64 + 1)
        })();

        self.unlock(&file);
        result
    }

    /// Posts the current log content, then cuts exactly that content off the
    /// front of the file. Lines appended meanwhile stay for the next round.
    pub async fn flush(self: &Arc<Self>, token: &UploadToken) -> Result<()> {
        let logger = Arc::clone(self);
        let Some(content) = blocking(move || logger.snapshot()).await? else {
            return Ok(());
        };
        if content.is_empty() {
            return Ok(());
        }

        let request = Request::new(Method::Post, format!("{}/log/3", self.uplog_url.trim_end_matches('/')))
            .header("Authorization", token.authorization())
            .header("Content-Type", "text/plain")
            .body(Body::Bytes(content.clone()));
        let response = self.caller.call(&request).await?;
        if !response.is_success() {
            warn!(
                status = response.status,
                error = %response.error_message(),
                "Uplog service rejected upload log"
            );
            return Ok(());
        }

        let logger = Arc::clone(self);
        let removed = blocking(move || logger.remove_prefix(&content)).await?;
        debug!(path = %self.path.display(), removed = removed, "Upload log shipped");
        Ok(())
    }

    /// Whole file content, `None` when there is no file yet
    fn snapshot(&self) -> Result<Option<Bytes>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.lock(&file, true)?;
        let mut content = Vec::new();
        let result = file.read_to_end(&mut content);
        self.unlock(&file);
        result?;
        Ok(Some(Bytes::from(content)))
    }

    /// Drops `shipped` from the front of the file if it is still there.
    /// Returns the number of bytes removed.
    fn remove_prefix(&self, shipped: &[u8]) -> Result<usize> {
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.lock(&file, true)?;
        let result = (|| -> Result<usize> {
            let mut current = Vec::new();
            file.read_to_end(&mut current)?;
            if !current.starts_with(shipped) {
                debug!("Upload log changed under the shipper, keeping it");
                return Ok(0);
            }
            let rest = &current[shipped.len()..];
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(rest)?;
            file.flush()?;
            Ok(shipped.len())
        })();
        self.unlock(&file);
        result
    }

    fn lock(&self, file: &File, exclusive: bool) -> io::Result<()> {
        match (self.lock_policy, exclusive) {
            (LockPolicy::None, _) => Ok(()),
            (LockPolicy::SharedAppendExclusiveUpload, false) => FileExt::lock_shared(file),
            _ => FileExt::lock_exclusive(file),
        }
    }

    fn unlock(&self, file: &File) {
        if self.lock_policy != LockPolicy::None {
            if let Err(e) = FileExt::unlock(file) {
                warn!(error = %e, "Failed to unlock upload log");
            }
        }
    }
}

/// Runs file work off the async worker threads
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use crate::error::HttpError;
    use crate::http::Response;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct RecordingCaller {
        status: u16,
        bodies: Mutex<Vec<(String, Vec<u8>)>>,
        /// Answers wait for a permit when set
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl HttpCaller for RecordingCaller {
        async fn call(&self, request: &Request) -> std::result::Result<Response, HttpError> {
            let body = match &request.body {
                Body::Bytes(bytes) => bytes.to_vec(),
                _ => Vec::new(),
            };
            self.bodies.lock().unwrap().push((request.url.clone(), body));
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            Ok(Response::new(self.status, Vec::new()))
        }
    }

    fn token() -> UploadToken {
        UploadToken::for_bucket(
            "test-bucket",
            &Credential::new("ak", "sk"),
            &Config::default(),
        )
        .unwrap()
    }

    fn record() -> UplogRecord {
        let mut record = UplogRecord::new(UpType::Form, "https://up.example.com");
        record.status_code = Some(200);
        record
    }

    fn logger(dir: &Path, caller: Arc<RecordingCaller>) -> UploadLogger {
        UploadLogger::new(dir.join("uplog.log"), "https://uplog.example.com", caller)
    }

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(RecordingCaller { status: 200, ..Default::default() });
        let logger = Arc::new(logger(dir.path(), caller.clone()));

        assert!(logger.log(&record(), Some(&token())).await.is_none());
        assert!(logger.log(&record(), Some(&token())).await.is_none());

        let content = fs::read_to_string(logger.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        for line in content.lines() {
            let parsed: UplogRecord = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.up_type, UpType::Form);
        }
        assert!(caller.bodies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ships_and_truncates_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(RecordingCaller { status: 200, ..Default::default() });
        let logger = Arc::new(
            UploadLogger::new(dir.path().join("uplog.log"), "https://uplog.example.com/", caller.clone())
                .upload_threshold(10),
        );

        let shipping = logger.log(&record(), Some(&token())).await.unwrap();
        shipping.await.unwrap();

        let bodies = caller.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].0, "https://uplog.example.com/log/3");
        assert!(String::from_utf8_lossy(&bodies[0].1).contains("\"up_type\":\"form\""));
        assert_eq!(fs::metadata(logger.path()).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_failed_shipping_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(RecordingCaller { status: 500, ..Default::default() });
        let logger = Arc::new(
            logger(dir.path(), caller.clone())
                .upload_threshold(10)
                .lock_policy(LockPolicy::AlwaysExclusive),
        );

        logger.log(&record(), Some(&token())).await.unwrap().await.unwrap();

        assert_eq!(caller.bodies.lock().unwrap().len(), 1);
        assert!(fs::metadata(logger.path()).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_appends_proceed_while_shipping_is_in_flight() {
        for policy in [LockPolicy::SharedAppendExclusiveUpload, LockPolicy::AlwaysExclusive] {
            let dir = tempfile::tempdir().unwrap();
            let gate = Arc::new(Semaphore::new(0));
            let caller = Arc::new(RecordingCaller {
                status: 200,
                gate: Some(gate.clone()),
                ..Default::default()
            });
            let logger = Arc::new(logger(dir.path(), caller.clone()).upload_threshold(1).lock_policy(policy));

            let shipping = logger.log(&record(), Some(&token())).await.unwrap();
            while caller.bodies.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            // the uplog service has not answered yet
            for _ in 0..3 {
                assert!(logger.log(&record(), Some(&token())).await.is_none());
            }
            gate.add_permits(1);
            shipping.await.unwrap();

            let shipped = String::from_utf8(caller.bodies.lock().unwrap()[0].1.clone()).unwrap();
            assert_eq!(shipped.lines().count(), 1, "{:?}", policy);
            let remaining = fs::read_to_string(logger.path()).unwrap();
            assert_eq!(remaining.lines().count(), 3, "{:?}", policy);
        }
    }

    #[tokio::test]
    async fn test_one_shipping_task_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let caller = Arc::new(RecordingCaller {
            status: 200,
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let logger = Arc::new(logger(dir.path(), caller.clone()).upload_threshold(1));

        let first = logger.log(&record(), Some(&token())).await;
        let second = logger.log(&record(), Some(&token())).await;
        assert!(first.is_some());
        assert!(second.is_none());

        gate.add_permits(1);
        first.unwrap().await.unwrap();
        assert_eq!(caller.bodies.lock().unwrap().len(), 1);
        assert!(logger.log(&record(), Some(&token())).await.is_some());
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_drops_records_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(RecordingCaller { status: 200, ..Default::default() });
        let logger = Arc::new(logger(dir.path(), caller).max_size(1).lock_policy(LockPolicy::None));

        logger.log(&record(), None).await;
        let size = fs::metadata(logger.path()).unwrap().len();
        logger.log(&record(), None).await;

        assert_eq!(fs::metadata(logger.path()).unwrap().len(), size);
    }

    #[tokio::test]
    async fn test_unwritable_path_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let caller = Arc::new(RecordingCaller::default());
        let logger = Arc::new(logger(&blocker, caller));

        // parent is a regular file, so every write fails
        assert!(logger.log(&record(), Some(&token())).await.is_none());
    }

    #[test]
    fn test_disabled_in_config() {
        let config = Config::builder().uplog_enabled(false).build();
        let caller: Arc<dyn HttpCaller> = Arc::new(RecordingCaller::default());
        assert!(UploadLogger::from_config(&config, caller).is_none());
    }
}
