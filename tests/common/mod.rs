//! In-memory object storage speaking the form, `mkblk`/`mkfile` and uplog protocols.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use bytes::Bytes;
use resumable_uploader::config::Config;
use resumable_uploader::credential::Credential;
use resumable_uploader::error::HttpError;
use resumable_uploader::etag::{block_checksum, etag_of_bytes};
use resumable_uploader::http::{Body, HttpCaller, Request, Response};
use resumable_uploader::region::Region;
use resumable_uploader::upload::{FileRecordStore, UploadManager, UploadManagerBuilder};
use resumable_uploader::upload_token::UploadToken;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const HOST_A: &str = "http://up-a.test";
pub const HOST_B: &str = "http://up-b.test";

#[derive(Default)]
struct State {
    blocks: HashMap<String, Bytes>,
    objects: HashMap<String, Bytes>,
    /// host -> status every request to it is answered with
    broken_hosts: HashMap<String, u16>,
    /// `mkblk` calls still allowed before every further one gets a 400
    mkblk_budget: Option<usize>,
    expire_next_mkfile: bool,
    corrupt_checksums: bool,
    requests: Vec<(String, String)>,
    /// Scope of every token presented, in arrival order
    scopes: Vec<String>,
    uplog_delay: Option<Duration>,
    /// Lines received on the uplog route
    uplog_lines: Vec<String>,
}

#[derive(Default)]
pub struct MockStorage {
    state: Mutex<State>,
    next_ctx: AtomicUsize,
    pub form_calls: AtomicUsize,
    pub mkblk_calls: AtomicUsize,
    pub mkfile_calls: AtomicUsize,
    pub uplog_calls: AtomicUsize,
}

impl MockStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn break_host(&self, host: &str, status: u16) {
        self.state.lock().unwrap().broken_hosts.insert(host_of(host), status);
    }

    pub fn allow_mkblk(&self, count: Option<usize>) {
        self.state.lock().unwrap().mkblk_budget = count;
    }

    pub fn expire_next_mkfile(&self) {
        self.state.lock().unwrap().expire_next_mkfile = true;
    }

    pub fn corrupt_checksums(&self) {
        self.state.lock().unwrap().corrupt_checksums = true;
    }

    /// Holds every uplog request this long before answering
    pub fn delay_uplog(&self, delay: Duration) {
        self.state.lock().unwrap().uplog_delay = Some(delay);
    }

    pub fn uplog_lines(&self) -> Vec<String> {
        self.state.lock().unwrap().uplog_lines.clone()
    }

    pub fn scopes(&self) -> Vec<String> {
        self.state.lock().unwrap().scopes.clone()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    /// Requests seen, as `(host, path)`
    pub fn requests(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_to(&self, host: &str) -> usize {
        let host = host_of(host);
        self.requests().iter().filter(|(h, _)| *h == host).count()
    }

    /// Successful exchanges of every kind
    pub fn exchanges(&self) -> usize {
        self.form_calls.load(Ordering::SeqCst)
            + self.mkblk_calls.load(Ordering::SeqCst)
            + self.mkfile_calls.load(Ordering::SeqCst)
    }

    fn form(&self, request: &Request) -> Response {
        let Body::Form(form) = &request.body else {
            return error(400, "expected multipart form");
        };
        let Some(token) = form.field("token") else {
            return error(401, "missing token");
        };
        let Some(file) = &form.file else {
            return error(400, "missing file");
        };
        let hash = etag_of_bytes(&file.data);
        let key = form.field("key").map(str::to_string).unwrap_or_else(|| hash.clone());
        if !self.admits(token, &key) {
            return error(403, "key outside token scope");
        }

        let corrupt = {
            let mut state = self.state.lock().unwrap();
            state.objects.insert(key.clone(), file.data.clone());
            state.corrupt_checksums
        };
        self.form_calls.fetch_add(1, Ordering::SeqCst);
        let hash = if corrupt {
            etag_of_bytes(b"something else")
        } else {
            hash
        };

        let mut body = Map::new();
        body.insert("key".to_string(), json!(key));
        body.insert("hash".to_string(), json!(hash));
        body.insert("fsize".to_string(), json!(file.data.len()));
        for (name, value) in &form.fields {
            if name.starts_with("x:") || name.starts_with("x-qn-meta-") {
                body.insert(name.clone(), json!(value));
            }
        }
        Response::new(200, Value::Object(body).to_string())
    }

    fn mkblk(&self, request: &Request, host: &str, size: &str) -> Response {
        if !request
            .header_value("Authorization")
            .is_some_and(|auth| auth.starts_with("UpToken "))
        {
            return error(401, "missing upload token");
        }
        let Body::Bytes(data) = &request.body else {
            return error(400, "expected block bytes");
        };
        if size.parse::<usize>().ok() != Some(data.len()) {
            return error(400, "block size mismatch");
        }

        let ctx = format!("ctx-{}", self.next_ctx.fetch_add(1, Ordering::SeqCst));
        let corrupt = {
            let mut state = self.state.lock().unwrap();
            if let Some(budget) = state.mkblk_budget.as_mut() {
                if *budget == 0 {
                    return error(400, "block rejected");
                }
                *budget -= 1;
            }
            state.blocks.insert(ctx.clone(), data.clone());
            state.corrupt_checksums
        };
        self.mkblk_calls.fetch_add(1, Ordering::SeqCst);

        let checksum = if corrupt {
            block_checksum(b"something else")
        } else {
            block_checksum(data)
        };
        let body = json!({
            "ctx": ctx,
            "checksum": checksum,
            "crc32": 0,
            "offset": data.len(),
            "host": format!("http://{}", host),
            "expired_at": chrono::Utc::now().timestamp() + 86_400,
        });
        Response::new(200, body.to_string())
    }

    fn mkfile(&self, request: &Request, segments: &[&str]) -> Response {
        let Some(size) = segments.first().and_then(|size| size.parse::<usize>().ok()) else {
            return error(400, "bad size");
        };
        let mut params = HashMap::new();
        for pair in segments[1..].chunks(2) {
            let [name, value] = pair else {
                return error(400, "odd mkfile path");
            };
            let Ok(decoded) = URL_SAFE.decode(value) else {
                return error(400, "bad base64 in mkfile path");
            };
            params.insert(name.to_string(), String::from_utf8_lossy(&decoded).into_owned());
        }
        let Body::Bytes(body) = &request.body else {
            return error(400, "expected contexts");
        };
        let token = request
            .header_value("Authorization")
            .and_then(|auth| auth.strip_prefix("UpToken "))
            .unwrap_or_default()
            .to_string();
        let scoped_key = params.get("key").cloned().unwrap_or_default();
        if !self.admits(&token, &scoped_key) {
            return error(403, "key outside token scope");
        }

        let mut state = self.state.lock().unwrap();
        if state.expire_next_mkfile {
            state.expire_next_mkfile = false;
            return error(701, "context expired");
        }
        let mut content = Vec::with_capacity(size);
        let contexts = String::from_utf8_lossy(body).into_owned();
        for ctx in contexts.split(',').filter(|ctx| !ctx.is_empty()) {
            let Some(block) = state.blocks.get(ctx) else {
                return error(701, "unknown context");
            };
            content.extend_from_slice(block);
        }
        if content.len() != size {
            return error(400, "assembled size mismatch");
        }

        let hash = etag_of_bytes(&content);
        let key = params.get("key").cloned().unwrap_or_else(|| hash.clone());
        state.objects.insert(key.clone(), Bytes::from(content));
        drop(state);
        self.mkfile_calls.fetch_add(1, Ordering::SeqCst);

        let mut response = Map::new();
        response.insert("key".to_string(), json!(key));
        response.insert("hash".to_string(), json!(hash));
        response.insert("fsize".to_string(), json!(size));
        for (name, value) in params {
            if name != "key" {
                response.insert(name, json!(value));
            }
        }
        Response::new(200, Value::Object(response).to_string())
    }

    /// Records the token's scope and checks `key` against it
    fn admits(&self, token: &str, key: &str) -> bool {
        let Ok(token) = UploadToken::parse(token) else {
            return false;
        };
        let policy = token.policy();
        self.state.lock().unwrap().scopes.push(policy.scope().to_string());
        match policy.key() {
            None => true,
            Some(prefix) if policy.is_prefixal_scope() => key.starts_with(prefix),
            Some(exact) => key == exact,
        }
    }

    async fn uplog(&self, request: &Request) -> Response {
        let delay = self.state.lock().unwrap().uplog_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let Body::Bytes(body) = &request.body else {
            return error(400, "expected log lines");
        };
        let lines = String::from_utf8_lossy(body);
        self.state
            .lock()
            .unwrap()
            .uplog_lines
            .extend(lines.lines().map(str::to_string));
        self.uplog_calls.fetch_add(1, Ordering::SeqCst);
        Response::new(200, "{}")
    }
}

#[async_trait]
impl HttpCaller for MockStorage {
    async fn call(&self, request: &Request) -> Result<Response, HttpError> {
        let host = host_of(&request.url);
        let path = request.path().to_string();
        let broken = {
            let mut state = self.state.lock().unwrap();
            state.requests.push((host.clone(), path.clone()));
            state.broken_hosts.get(&host).copied()
        };
        if let Some(status) = broken {
            return Ok(error(status, "host is down"));
        }

        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let response = match segments.as_slice() {
            [""] => self.form(request),
            ["mkblk", size] => self.mkblk(request, &host, size),
            ["mkfile", rest @ ..] => self.mkfile(request, rest),
            ["log", "3"] => self.uplog(request).await,
            _ => error(404, "no such route"),
        };
        Ok(response)
    }
}

fn error(status: u16, message: &str) -> Response {
    Response::new(status, json!({ "error": message }).to_string())
}

fn host_of(url: &str) -> String {
    url.split_once("://")
        .map_or(url, |(_, rest)| rest)
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

pub fn region() -> Region {
    Region::custom(
        "mock",
        vec![HOST_A.to_string(), HOST_B.to_string()],
        vec![HOST_A.to_string(), HOST_B.to_string()],
    )
}

/// Test config: mock region, no DNS, no delays, no uplog, records under `dir`
pub fn config(dir: &Path) -> resumable_uploader::config::ConfigBuilder {
    Config::builder()
        .regions(vec![region()])
        .url_resolution(false)
        .retry_delay(Duration::ZERO)
        .uplog_enabled(false)
        .record_root(dir.join("records"))
}

pub fn manager_builder(config: Config, storage: &Arc<MockStorage>) -> UploadManagerBuilder {
    let records = FileRecordStore::new(config.record_root());
    UploadManager::builder(config)
        .caller(Arc::clone(storage) as Arc<dyn HttpCaller>)
        .record_store(Arc::new(records))
}

pub fn manager(config: Config, storage: &Arc<MockStorage>) -> UploadManager {
    manager_builder(config, storage).build().unwrap()
}

pub fn credential() -> Credential {
    Credential::new("test-access-key", "test-secret-key")
}

pub fn token(bucket: &str) -> UploadToken {
    UploadToken::for_bucket(bucket, &credential(), &Config::default()).unwrap()
}

/// Deterministic pseudo-random content
pub fn content(size: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..size)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}
