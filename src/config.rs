use crate::error::{ErrorContext, Result, UploadError};
use crate::region::Region;
use crate::uplog::LockPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const APP_DIR_NAME: &str = "resumable-uploader";

pub const DEFAULT_UC_HOST: &str = "uc.qbox.me";
pub const DEFAULT_UPLOG_HOST: &str = "uplog.qbox.me";

/// Chunk sizes are kept a multiple of this
pub const CHUNK_ALIGNMENT: u64 = 1 << 22;

#[derive(Debug, Clone)]
struct ConfigInner {
    use_https: bool,
    regions: Vec<Region>,
    uc_host: String,
    uplog_host: String,
    user_agent: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    low_speed_limit: u64,
    low_speed_time: Duration,
    retries: usize,
    retry_delay: Duration,
    upload_threshold: u64,
    chunk_size: u64,
    max_concurrency: usize,
    max_total_concurrency: usize,
    token_lifetime: Duration,
    domain_freeze_duration: Duration,
    resolutions_cache_lifetime: Duration,
    resolve_retries: usize,
    url_resolution: bool,
    domains_persist_path: Option<PathBuf>,
    auto_persist_interval: Option<Duration>,
    uplog_enabled: bool,
    uplog_lock_policy: LockPolicy,
    uplog_max_size: u64,
    uplog_upload_threshold: u64,
    uplog_path: PathBuf,
    record_root: PathBuf,
    block_lifetime: Duration,
}

impl Default for ConfigInner {
    fn default() -> Self {
        let base_dir = default_data_dir();
        let pool = default_thread_pool_size();
        Self {
            use_https: true,
            regions: Vec::new(),
            uc_host: DEFAULT_UC_HOST.to_string(),
            uplog_host: DEFAULT_UPLOG_HOST.to_string(),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5 * 60),
            low_speed_limit: 1024,
            low_speed_time: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_secs(1),
            upload_threshold: 1 << 22,
            chunk_size: 1 << 22,
            max_concurrency: 4,
            max_total_concurrency: pool,
            token_lifetime: Duration::from_secs(3600),
            domain_freeze_duration: Duration::from_secs(10 * 60),
            resolutions_cache_lifetime: Duration::from_secs(3600),
            resolve_retries: 2,
            url_resolution: true,
            domains_persist_path: None,
            auto_persist_interval: Some(Duration::from_secs(30 * 60)),
            uplog_enabled: true,
            uplog_lock_policy: LockPolicy::default(),
            uplog_max_size: 1 << 22,
            uplog_upload_threshold: 1 << 12,
            uplog_path: base_dir.join("uplog.log"),
            record_root: base_dir.join("records"),
            block_lifetime: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Immutable engine configuration, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn use_https(&self) -> bool {
        self.inner.use_https
    }

    pub fn regions(&self) -> &[Region] {
        &self.inner.regions
    }

    pub fn uc_host(&self) -> &str {
        &self.inner.uc_host
    }

    pub fn uplog_host(&self) -> &str {
        &self.inner.uplog_host
    }

    pub fn user_agent(&self) -> &str {
        &self.inner.user_agent
    }

    pub fn connect_timeout(&self) -> Duration {
        self.inner.connect_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    /// Bytes per second below which a transfer counts as stalled
    pub fn low_speed_limit(&self) -> u64 {
        self.inner.low_speed_limit
    }

    pub fn low_speed_time(&self) -> Duration {
        self.inner.low_speed_time
    }

    pub fn retries(&self) -> usize {
        self.inner.retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.inner.retry_delay
    }

    pub fn upload_threshold(&self) -> u64 {
        self.inner.upload_threshold
    }

    pub fn chunk_size(&self) -> u64 {
        self.inner.chunk_size
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    pub fn max_total_concurrency(&self) -> usize {
        self.inner.max_total_concurrency
    }

    pub fn token_lifetime(&self) -> Duration {
        self.inner.token_lifetime
    }

    pub fn domain_freeze_duration(&self) -> Duration {
        self.inner.domain_freeze_duration
    }

    pub fn resolutions_cache_lifetime(&self) -> Duration {
        self.inner.resolutions_cache_lifetime
    }

    pub fn resolve_retries(&self) -> usize {
        self.inner.resolve_retries
    }

    pub fn url_resolution(&self) -> bool {
        self.inner.url_resolution
    }

    pub fn domains_persist_path(&self) -> Option<&Path> {
        self.inner.domains_persist_path.as_deref()
    }

    pub fn auto_persist_interval(&self) -> Option<Duration> {
        self.inner.auto_persist_interval
    }

    pub fn uplog_enabled(&self) -> bool {
        self.inner.uplog_enabled
    }

    pub fn uplog_lock_policy(&self) -> LockPolicy {
        self.inner.uplog_lock_policy
    }

    pub fn uplog_max_size(&self) -> u64 {
        self.inner.uplog_max_size
    }

    pub fn uplog_upload_threshold(&self) -> u64 {
        self.inner.uplog_upload_threshold
    }

    pub fn uplog_path(&self) -> &Path {
        &self.inner.uplog_path
    }

    pub fn record_root(&self) -> &Path {
        &self.inner.record_root
    }

    pub fn block_lifetime(&self) -> Duration {
        self.inner.block_lifetime
    }

    pub fn uc_url(&self) -> String {
        with_scheme(self.use_https(), self.uc_host())
    }

    pub fn uplog_url(&self) -> String {
        with_scheme(self.use_https(), self.uplog_host())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| UploadError::Config(format!("Invalid config file: {}", e)))?;
        file.into_builder().map(|builder| builder.build())
    }

    /// Reads a TOML config file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        Self::from_toml_str(&content)
    }
}

fn with_scheme(use_https: bool, host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else if use_https {
        format!("https://{}", host)
    } else {
        format!("http://{}", host)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    inner: ConfigInner,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_https(mut self, use_https: bool) -> Self {
        self.inner.use_https = use_https;
        self
    }

    pub fn regions(mut self, regions: Vec<Region>) -> Self {
        self.inner.regions = regions;
        self
    }

    pub fn uc_host(mut self, host: impl Into<String>) -> Self {
        self.inner.uc_host = host.into();
        self
    }

    pub fn uplog_host(mut self, host: impl Into<String>) -> Self {
        self.inner.uplog_host = host.into();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.inner.user_agent = user_agent.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.inner.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.inner.request_timeout = timeout;
        self
    }

    pub fn low_speed_limit(mut self, bytes_per_sec: u64) -> Self {
        self.inner.low_speed_limit = bytes_per_sec;
        self
    }

    pub fn low_speed_time(mut self, time: Duration) -> Self {
        self.inner.low_speed_time = time;
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.inner.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.inner.retry_delay = delay;
        self
    }

    pub fn upload_threshold(mut self, threshold: u64) -> Self {
        self.inner.upload_threshold = threshold;
        self
    }

    /// Rounded up to a multiple of 4 MiB
    pub fn chunk_size(mut self, size: u64) -> Self {
        self.inner.chunk_size = align_chunk_size(size);
        self
    }

    pub fn max_concurrency(mut self, concurrency: usize) -> Self {
        self.inner.max_concurrency = concurrency.max(1);
        self
    }

    pub fn max_total_concurrency(mut self, concurrency: usize) -> Self {
        self.inner.max_total_concurrency = concurrency.max(1);
        self
    }

    pub fn token_lifetime(mut self, lifetime: Duration) -> Self {
        self.inner.token_lifetime = lifetime;
        self
    }

    pub fn domain_freeze_duration(mut self, duration: Duration) -> Self {
        self.inner.domain_freeze_duration = duration;
        self
    }

    pub fn resolutions_cache_lifetime(mut self, lifetime: Duration) -> Self {
        self.inner.resolutions_cache_lifetime = lifetime;
        self
    }

    pub fn resolve_retries(mut self, retries: usize) -> Self {
        self.inner.resolve_retries = retries;
        self
    }

    pub fn url_resolution(mut self, enabled: bool) -> Self {
        self.inner.url_resolution = enabled;
        self
    }

    pub fn domains_persist_path(mut self, path: Option<PathBuf>) -> Self {
        self.inner.domains_persist_path = path;
        self
    }

    pub fn auto_persist_interval(mut self, interval: Option<Duration>) -> Self {
        self.inner.auto_persist_interval = interval;
        self
    }

    pub fn uplog_enabled(mut self, enabled: bool) -> Self {
        self.inner.uplog_enabled = enabled;
        self
    }

    pub fn uplog_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.inner.uplog_lock_policy = policy;
        self
    }

    pub fn uplog_max_size(mut self, size: u64) -> Self {
        self.inner.uplog_max_size = size;
        self
    }

    pub fn uplog_upload_threshold(mut self, threshold: u64) -> Self {
        self.inner.uplog_upload_threshold = threshold;
        self
    }

    pub fn uplog_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.uplog_path = path.into();
        self
    }

    pub fn record_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.record_root = path.into();
        self
    }

    pub fn block_lifetime(mut self, lifetime: Duration) -> Self {
        self.inner.block_lifetime = lifetime;
        self
    }

    pub fn build(self) -> Config {
        Config {
            inner: Arc::new(self.inner),
        }
    }
}

fn align_chunk_size(size: u64) -> u64 {
    let size = size.max(1);
    size.div_ceil(CHUNK_ALIGNMENT) * CHUNK_ALIGNMENT
}

/// On-disk TOML layout. Every field is optional; absent ones keep the defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    use_https: Option<bool>,
    regions: Option<Vec<String>>,
    up_hosts: Option<Vec<String>>,
    uc_host: Option<String>,
    uplog_host: Option<String>,
    user_agent: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    low_speed_limit: Option<u64>,
    low_speed_time_secs: Option<u64>,
    retries: Option<usize>,
    retry_delay_ms: Option<u64>,
    upload_threshold: Option<u64>,
    chunk_size: Option<u64>,
    max_concurrency: Option<usize>,
    max_total_concurrency: Option<usize>,
    token_lifetime_secs: Option<u64>,
    domain_freeze_duration_secs: Option<u64>,
    resolutions_cache_lifetime_secs: Option<u64>,
    resolve_retries: Option<usize>,
    url_resolution: Option<bool>,
    domains_persist_path: Option<PathBuf>,
    auto_persist_interval_secs: Option<u64>,
    uplog_enabled: Option<bool>,
    uplog_lock_policy: Option<LockPolicy>,
    uplog_max_size: Option<u64>,
    uplog_upload_threshold: Option<u64>,
    uplog_path: Option<PathBuf>,
    record_root: Option<PathBuf>,
    block_lifetime_secs: Option<u64>,
}

impl ConfigFile {
    fn into_builder(self) -> Result<ConfigBuilder> {
        let mut builder = ConfigBuilder::new();
        let secs = Duration::from_secs;

        if let Some(v) = self.use_https {
            builder = builder.use_https(v);
        }
        let mut regions = Vec::new();
        for id in self.regions.unwrap_or_default() {
            let region = Region::by_id(&id)
                .ok_or_else(|| UploadError::Config(format!("Unknown region id: {}", id)))?;
            regions.push(region);
        }
        if let Some(hosts) = self.up_hosts.filter(|hosts| !hosts.is_empty()) {
            regions.insert(0, Region::custom("custom", hosts.clone(), hosts));
        }
        builder = builder.regions(regions);
        if let Some(v) = self.uc_host {
            builder = builder.uc_host(v);
        }
        if let Some(v) = self.uplog_host {
            builder = builder.uplog_host(v);
        }
        if let Some(v) = self.user_agent {
            builder = builder.user_agent(v);
        }
        if let Some(v) = self.connect_timeout_secs {
            builder = builder.connect_timeout(secs(v));
        }
        if let Some(v) = self.request_timeout_secs {
            builder = builder.request_timeout(secs(v));
        }
        if let Some(v) = self.low_speed_limit {
            builder = builder.low_speed_limit(v);
        }
        if let Some(v) = self.low_speed_time_secs {
            builder = builder.low_speed_time(secs(v));
        }
        if let Some(v) = self.retries {
            builder = builder.retries(v);
        }
        if let Some(v) = self.retry_delay_ms {
            builder = builder.retry_delay(Duration::from_millis(v));
        }
        if let Some(v) = self.upload_threshold {
            builder = builder.upload_threshold(v);
        }
        if let Some(v) = self.chunk_size {
            builder = builder.chunk_size(v);
        }
        if let Some(v) = self.max_concurrency {
            builder = builder.max_concurrency(v);
        }
        if let Some(v) = self.max_total_concurrency {
            builder = builder.max_total_concurrency(v);
        }
        if let Some(v) = self.token_lifetime_secs {
            builder = builder.token_lifetime(secs(v));
        }
        if let Some(v) = self.domain_freeze_duration_secs {
            builder = builder.domain_freeze_duration(secs(v));
        }
        if let Some(v) = self.resolutions_cache_lifetime_secs {
            builder = builder.resolutions_cache_lifetime(secs(v));
        }
        if let Some(v) = self.resolve_retries {
            builder = builder.resolve_retries(v);
        }
        if let Some(v) = self.url_resolution {
            builder = builder.url_resolution(v);
        }
        if self.domains_persist_path.is_some() {
            builder = builder.domains_persist_path(self.domains_persist_path);
        }
        if let Some(v) = self.auto_persist_interval_secs {
            // zero turns auto persistence off
            builder = builder.auto_persist_interval((v > 0).then(|| secs(v)));
        }
        if let Some(v) = self.uplog_enabled {
            builder = builder.uplog_enabled(v);
        }
        if let Some(v) = self.uplog_lock_policy {
            builder = builder.uplog_lock_policy(v);
        }
        if let Some(v) = self.uplog_max_size {
            builder = builder.uplog_max_size(v);
        }
        if let Some(v) = self.uplog_upload_threshold {
            builder = builder.uplog_upload_threshold(v);
        }
        if let Some(v) = self.uplog_path {
            builder = builder.uplog_path(v);
        }
        if let Some(v) = self.record_root {
            builder = builder.record_root(v);
        }
        if let Some(v) = self.block_lifetime_secs {
            builder = builder.block_lifetime(secs(v));
        }
        Ok(builder)
    }
}

/// Available parallelism, never less than 2
pub fn default_thread_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}

/// Where uplog and upload records live unless configured otherwise
pub fn default_data_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join("config.toml"))
        .ok_or_else(|| UploadError::Config("Could not find config directory".to_string()))
}

pub fn get_logs_dir() -> PathBuf {
    default_data_dir().join("logs")
}

/// Creates `dir` (owner-only on Unix) if it does not exist yet
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(dir)?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o700);
            fs::set_permissions(dir, permissions)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.use_https());
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.low_speed_limit(), 1024);
        assert_eq!(config.low_speed_time(), Duration::from_secs(30));
        assert_eq!(config.retries(), 3);
        assert_eq!(config.upload_threshold(), 4 * 1024 * 1024);
        assert_eq!(config.chunk_size(), 4 * 1024 * 1024);
        assert_eq!(config.max_concurrency(), 4);
        assert!(config.max_total_concurrency() >= 2);
        assert_eq!(config.token_lifetime(), Duration::from_secs(3600));
        assert_eq!(config.domain_freeze_duration(), Duration::from_secs(600));
        assert_eq!(config.resolve_retries(), 2);
        assert_eq!(config.uplog_max_size(), 4 * 1024 * 1024);
        assert_eq!(config.uplog_upload_threshold(), 4 * 1024);
        assert_eq!(config.uplog_lock_policy(), LockPolicy::SharedAppendExclusiveUpload);
        assert_eq!(config.block_lifetime(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.uc_url(), "https://uc.qbox.me");
    }

    #[test]
    fn test_chunk_size_alignment() {
        assert_eq!(Config::builder().chunk_size(1).build().chunk_size(), 1 << 22);
        assert_eq!(
            Config::builder().chunk_size((1 << 22) + 1).build().chunk_size(),
            2 << 22
        );
        assert_eq!(Config::builder().chunk_size(8 << 20).build().chunk_size(), 8 << 20);
    }

    #[test]
    fn test_from_toml_str() {
        let config = Config::from_toml_str(
            r#"
            use_https = false
            regions = ["z1"]
            up_hosts = ["up.example.com"]
            retries = 5
            retry_delay_ms = 10
            chunk_size = 5000000
            uplog_lock_policy = "always_exclusive"
            auto_persist_interval_secs = 0
            "#,
        )
        .unwrap();

        assert!(!config.use_https());
        assert_eq!(config.regions().len(), 2);
        assert_eq!(config.regions()[0].id(), "custom");
        assert_eq!(config.regions()[1].id(), "z1");
        assert_eq!(config.retries(), 5);
        assert_eq!(config.retry_delay(), Duration::from_millis(10));
        assert_eq!(config.chunk_size(), 8 << 20);
        assert_eq!(config.uplog_lock_policy(), LockPolicy::AlwaysExclusive);
        assert_eq!(config.auto_persist_interval(), None);
        assert_eq!(config.uc_url(), "http://uc.qbox.me");
    }

    #[test]
    fn test_from_toml_rejects_unknown() {
        assert!(Config::from_toml_str("no_such_option = 1").is_err());
        assert!(Config::from_toml_str("regions = [\"mars\"]").is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.retries(), 3);
    }

    #[test]
    fn test_ensure_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
