//! Endpoint health and DNS caching.
//!
//! `DomainsManager` owns every piece of per-endpoint state: when a host was
//! frozen, until when, and which addresses it resolved to. It is shared as an
//! `Arc` between the transport, the reqwest resolver and any number of upload
//! managers.

mod persist;
mod resolver;

pub use persist::{DomainsSnapshot, FilePersistSink, FrozenHost, PersistSink, ResolvedHost};
pub(crate) use persist::write_atomically;
pub use resolver::DomainsResolver;

use crate::config::Config;
use crate::error::{Result, UploadError};
use crate::region::{Region, UpPurpose};
use crate::time::{chrono_duration, system_clock, Clock};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One candidate endpoint as seen at selection time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEntry {
    pub url: String,
    /// Position in the region's host list, lower is preferred
    pub priority: usize,
    pub frozen_at: Option<DateTime<Utc>>,
    pub frozen_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct FreezeState {
    frozen_at: DateTime<Utc>,
    frozen_until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CachedResolution {
    addrs: Vec<IpAddr>,
    cached_at: DateTime<Utc>,
}

pub struct DomainsManager {
    frozen: DashMap<String, FreezeState>,
    resolutions: DashMap<String, CachedResolution>,
    clock: Arc<dyn Clock>,
    freeze_duration: Duration,
    resolutions_cache_lifetime: Duration,
    resolve_retries: usize,
    sink: Option<Arc<dyn PersistSink>>,
}

impl std::fmt::Debug for DomainsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainsManager")
            .field("frozen", &self.frozen.len())
            .field("resolutions", &self.resolutions.len())
            .field("freeze_duration", &self.freeze_duration)
            .field("resolutions_cache_lifetime", &self.resolutions_cache_lifetime)
            .field("resolve_retries", &self.resolve_retries)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for DomainsManager {
    fn default() -> Self {
        DomainsManagerBuilder::default().build()
    }
}

impl DomainsManager {
    pub fn builder() -> DomainsManagerBuilder {
        DomainsManagerBuilder::default()
    }

    /// Endpoints of `region` for `purpose`, in priority order, minus the frozen ones.
    /// If every endpoint is frozen, the one frozen longest ago is returned alone.
    pub fn candidates(&self, region: &Region, purpose: UpPurpose, use_https: bool) -> Vec<DomainEntry> {
        let now = self.clock.now();
        let all: Vec<DomainEntry> = region
            .urls(purpose, use_https)
            .into_iter()
            .enumerate()
            .map(|(priority, url)| {
                let state = self.frozen.get(&host_key(&url)).map(|s| *s);
                DomainEntry {
                    url,
                    priority,
                    frozen_at: state.map(|s| s.frozen_at),
                    frozen_until: state.map(|s| s.frozen_until),
                }
            })
            .collect();

        let available: Vec<DomainEntry> = all
            .iter()
            .filter(|entry| entry.frozen_until.map_or(true, |until| until <= now))
            .cloned()
            .collect();
        if !available.is_empty() || all.is_empty() {
            return available;
        }

        let fallback = all
            .into_iter()
            .min_by_key(|entry| (entry.frozen_at, entry.priority));
        if let Some(entry) = &fallback {
            debug!(host = %entry.url, region = region.id(), "All endpoints frozen, using least recently frozen");
        }
        fallback.into_iter().collect()
    }

    /// Freezes the host of `url` for `duration`, starting now
    pub fn freeze(&self, url: &str, duration: Duration) {
        let now = self.clock.now();
        let state = FreezeState {
            frozen_at: now,
            frozen_until: now + chrono_duration(duration),
        };
        info!(host = url, seconds = duration.as_secs(), "Freezing endpoint");
        self.frozen.insert(host_key(url), state);
    }

    /// Freezes for the manager's default duration
    pub fn freeze_default(&self, url: &str) {
        self.freeze(url, self.freeze_duration);
    }

    pub fn unfreeze(&self, url: &str) {
        self.frozen.remove(&host_key(url));
    }

    pub fn is_frozen(&self, url: &str) -> bool {
        let now = self.clock.now();
        self.frozen
            .get(&host_key(url))
            .map_or(false, |state| state.frozen_until > now)
    }

    pub fn freeze_duration(&self) -> Duration {
        self.freeze_duration
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Resolves the host of `url`, with the URL's port (or the scheme default) applied
    pub async fn resolve(&self, url: &str) -> Result<Vec<SocketAddr>> {
        let parsed = url::Url::parse(url).map_err(|e| UploadError::EndpointUnresolved {
            host: url.to_string(),
            message: e.to_string(),
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| UploadError::EndpointUnresolved {
                host: url.to_string(),
                message: "URL has no host".to_string(),
            })?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);

        let addrs = self.resolve_host(&host).await?;
        Ok(addrs.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }

    /// Resolves a bare host name through the cache
    pub async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let now = self.clock.now();
        let lifetime = chrono_duration(self.resolutions_cache_lifetime);
        if let Some(cached) = self.resolutions.get(host) {
            if cached.cached_at + lifetime > now {
                return Ok(cached.addrs.clone());
            }
        }

        let mut last_error = String::new();
        for attempt in 0..=self.resolve_retries {
            match tokio::net::lookup_host((host, 0)).await {
                Ok(addrs) => {
                    let mut ips: Vec<IpAddr> = Vec::new();
                    for addr in addrs {
                        if !ips.contains(&addr.ip()) {
                            ips.push(addr.ip());
                        }
                    }
                    if ips.is_empty() {
                        last_error = "no addresses returned".to_string();
                        continue;
                    }
                    self.resolutions.insert(
                        host.to_string(),
                        CachedResolution {
                            addrs: ips.clone(),
                            cached_at: self.clock.now(),
                        },
                    );
                    return Ok(ips);
                }
                Err(e) => {
                    debug!(host = host, attempt = attempt, error = %e, "DNS lookup failed");
                    last_error = e.to_string();
                }
            }
        }

        warn!(host = host, error = %last_error, "Giving up resolving endpoint");
        Err(UploadError::EndpointUnresolved {
            host: host.to_string(),
            message: last_error,
        })
    }

    /// Drops a cached resolution so the next lookup goes to DNS
    pub fn forget_resolution(&self, host: &str) {
        self.resolutions.remove(host);
    }

    pub fn snapshot(&self) -> DomainsSnapshot {
        DomainsSnapshot {
            frozen: self
                .frozen
                .iter()
                .map(|entry| FrozenHost {
                    host: entry.key().clone(),
                    frozen_at: entry.frozen_at,
                    frozen_until: entry.frozen_until,
                })
                .collect(),
            resolutions: self
                .resolutions
                .iter()
                .map(|entry| ResolvedHost {
                    host: entry.key().clone(),
                    addrs: entry.addrs.clone(),
                    cached_at: entry.cached_at,
                })
                .collect(),
        }
    }

    /// Writes freeze state and resolutions to the sink. Without a sink this does nothing.
    pub fn persist(&self) -> Result<()> {
        match &self.sink {
            Some(sink) => sink.save(&self.snapshot()),
            None => Ok(()),
        }
    }

    /// Merges the sink's snapshot into memory, skipping entries that already expired
    pub fn load(&self) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let Some(snapshot) = sink.load()? else {
            return Ok(());
        };

        let now = self.clock.now();
        let lifetime = chrono_duration(self.resolutions_cache_lifetime);
        for frozen in snapshot.frozen {
            if frozen.frozen_until > now {
                self.frozen.insert(
                    frozen.host,
                    FreezeState {
                        frozen_at: frozen.frozen_at,
                        frozen_until: frozen.frozen_until,
                    },
                );
            }
        }
        for resolved in snapshot.resolutions {
            if resolved.cached_at + lifetime > now && !resolved.addrs.is_empty() {
                self.resolutions.insert(
                    resolved.host,
                    CachedResolution {
                        addrs: resolved.addrs,
                        cached_at: resolved.cached_at,
                    },
                );
            }
        }
        Ok(())
    }

    /// Persists every `interval` for as long as the manager is alive
    pub fn spawn_auto_persist(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if self.sink.is_none() || interval.is_zero() {
            return None;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = manager.persist() {
                    warn!(error = %e, "Failed to persist domain state");
                }
            }
        }))
    }
}

/// Freeze state is tracked per `host[:port]`, independent of scheme
pub(crate) fn host_key(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => url.to_string(),
        },
        Err(_) => url.trim_end_matches('/').to_string(),
    }
}

#[derive(Clone)]
pub struct DomainsManagerBuilder {
    clock: Arc<dyn Clock>,
    freeze_duration: Duration,
    resolutions_cache_lifetime: Duration,
    resolve_retries: usize,
    sink: Option<Arc<dyn PersistSink>>,
}

impl Default for DomainsManagerBuilder {
    fn default() -> Self {
        Self {
            clock: system_clock(),
            freeze_duration: Duration::from_secs(10 * 60),
            resolutions_cache_lifetime: Duration::from_secs(3600),
            resolve_retries: 2,
            sink: None,
        }
    }
}

impl DomainsManagerBuilder {
    /// Durations, retries and the file sink taken from `config`
    pub fn from_config(config: &Config) -> Self {
        let builder = Self::default()
            .freeze_duration(config.domain_freeze_duration())
            .resolutions_cache_lifetime(config.resolutions_cache_lifetime())
            .resolve_retries(config.resolve_retries());
        match config.domains_persist_path() {
            Some(path) => builder.persist_sink(Arc::new(FilePersistSink::new(path))),
            None => builder,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn freeze_duration(mut self, duration: Duration) -> Self {
        self.freeze_duration = duration;
        self
    }

    pub fn resolutions_cache_lifetime(mut self, lifetime: Duration) -> Self {
        self.resolutions_cache_lifetime = lifetime;
        self
    }

    pub fn resolve_retries(mut self, retries: usize) -> Self {
        self.resolve_retries = retries;
        self
    }

    pub fn persist_sink(mut self, sink: Arc<dyn PersistSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the manager and loads any persisted state. A sink that fails to
    /// load is logged and otherwise ignored.
    pub fn build(self) -> DomainsManager {
        let manager = DomainsManager {
            frozen: DashMap::new(),
            resolutions: DashMap::new(),
            clock: self.clock,
            freeze_duration: self.freeze_duration,
            resolutions_cache_lifetime: self.resolutions_cache_lifetime,
            resolve_retries: self.resolve_retries,
            sink: self.sink,
        };
        if let Err(e) = manager.load() {
            warn!(error = %e, "Failed to load persisted domain state");
        }
        manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn region() -> Region {
        Region::custom(
            "test",
            vec!["a.example.com".to_string(), "b.example.com".to_string()],
            vec!["c.example.com".to_string()],
        )
    }

    fn manager(clock: &ManualClock) -> DomainsManager {
        DomainsManager::builder().clock(Arc::new(clock.clone())).build()
    }

    #[test]
    fn test_candidates_in_priority_order() {
        let clock = ManualClock::default();
        let domains = manager(&clock);

        let candidates = domains.candidates(&region(), UpPurpose::Direct, true);
        let urls: Vec<&str> = candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example.com", "https://b.example.com"]);
        assert_eq!(candidates[1].priority, 1);
    }

    #[test]
    fn test_freeze_window() {
        let clock = ManualClock::default();
        let domains = manager(&clock);
        let freeze = Duration::from_secs(600);

        domains.freeze("https://a.example.com", freeze);
        assert!(domains.is_frozen("https://a.example.com"));
        // scheme does not matter
        assert!(domains.is_frozen("http://a.example.com"));

        let candidates = domains.candidates(&region(), UpPurpose::Direct, true);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].url, "https://b.example.com");

        clock.advance(freeze - Duration::from_secs(1));
        assert!(domains.is_frozen("https://a.example.com"));

        clock.advance(Duration::from_secs(1));
        assert!(!domains.is_frozen("https://a.example.com"));
        assert_eq!(domains.candidates(&region(), UpPurpose::Direct, true).len(), 2);
    }

    #[test]
    fn test_all_frozen_returns_least_recently_frozen() {
        let clock = ManualClock::default();
        let domains = manager(&clock);

        domains.freeze("https://b.example.com", Duration::from_secs(600));
        clock.advance(Duration::from_secs(10));
        domains.freeze("https://a.example.com", Duration::from_secs(600));

        let candidates = domains.candidates(&region(), UpPurpose::Direct, true);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].url, "https://b.example.com");
        assert!(candidates[0].frozen_until.is_some());
    }

    #[test]
    fn test_all_frozen_at_same_time_prefers_priority() {
        let clock = ManualClock::default();
        let domains = manager(&clock);

        domains.freeze("https://b.example.com", Duration::from_secs(600));
        domains.freeze("https://a.example.com", Duration::from_secs(600));

        let candidates = domains.candidates(&region(), UpPurpose::Direct, true);
        assert_eq!(candidates[0].url, "https://a.example.com");
    }

    #[test]
    fn test_unfreeze() {
        let domains = DomainsManager::default();
        domains.freeze_default("https://a.example.com");
        assert!(domains.is_frozen("https://a.example.com"));
        domains.unfreeze("https://a.example.com");
        assert!(!domains.is_frozen("https://a.example.com"));
    }

    #[test]
    fn test_host_key() {
        assert_eq!(host_key("https://up.example.com/"), "up.example.com");
        assert_eq!(host_key("http://127.0.0.1:9000"), "127.0.0.1:9000");
        assert_eq!(host_key("not a url/"), "not a url");
    }

    #[tokio::test]
    async fn test_resolve_ip_literal_and_localhost() {
        let domains = DomainsManager::default();

        let addrs = domains.resolve("http://127.0.0.1:9000").await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:9000".parse().unwrap()]);

        let addrs = domains.resolve("https://localhost").await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|addr| addr.port() == 443));
        assert_eq!(domains.snapshot().resolutions.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_failure_is_endpoint_unresolved_and_does_not_freeze() {
        let domains = DomainsManager::builder().resolve_retries(0).build();
        let err = domains
            .resolve("https://no-such-host.invalid")
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::EndpointUnresolved { .. }));
        assert!(!domains.is_frozen("https://no-such-host.invalid"));
    }

    #[tokio::test]
    async fn test_cached_resolution_expires() {
        let clock = ManualClock::default();
        let domains = DomainsManager::builder()
            .clock(Arc::new(clock.clone()))
            .resolutions_cache_lifetime(Duration::from_secs(60))
            .build();

        domains.resolutions.insert(
            "cached.invalid".to_string(),
            CachedResolution {
                addrs: vec!["10.0.0.1".parse().unwrap()],
                cached_at: clock.now(),
            },
        );
        let ips = domains.resolve_host("cached.invalid").await.unwrap();
        assert_eq!(ips, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);

        clock.advance(Duration::from_secs(61));
        assert!(domains.resolve_host("cached.invalid").await.is_err());
    }
}
