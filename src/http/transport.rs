use super::{
    classify_error_kind, classify_status, Body, HookError, Hooks, HttpCaller, Method, Request,
    Response, RetryStrategy,
};
use crate::config::Config;
use crate::domains::{DomainEntry, DomainsManager};
use crate::error::{HttpError, HttpErrorKind, Result, RetryKind, UploadError};
use crate::region::{Region, UpPurpose};
use crate::upload_token::UploadToken;
use crate::uplog::{UpType, UploadLogger, UplogRecord};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Decides what happens to a host after a host-level failure
pub trait FreezePolicy: Send + Sync {
    fn on_host_failure(&self, domains: &DomainsManager, url: &str, error: &HttpError);
}

/// Freezes the host for a fixed duration
#[derive(Debug, Clone, Copy)]
pub struct DefaultFreezePolicy {
    duration: Duration,
}

impl DefaultFreezePolicy {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl FreezePolicy for DefaultFreezePolicy {
    fn on_host_failure(&self, domains: &DomainsManager, url: &str, error: &HttpError) {
        if error.retry_kind() == RetryKind::HostUnretryable {
            domains.freeze(url, self.duration);
        }
    }
}

/// A request without its host; the transport fills in the endpoint per attempt
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    /// Path and query, starting with `/`
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub purpose: UpPurpose,
    pub up_type: UpType,
    /// Size of the whole object, for the upload log
    pub total_size: u64,
    /// A 2xx response that is not JSON counts as a retryable failure
    pub expect_json: bool,
}

impl RequestTemplate {
    pub fn post(path: impl Into<String>, purpose: UpPurpose, up_type: UpType) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            headers: Vec::new(),
            body: Body::Empty,
            purpose,
            up_type,
            total_size: 0,
            expect_json: true,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn total_size(mut self, size: u64) -> Self {
        self.total_size = size;
        self
    }

    fn to_request(&self, endpoint: &str) -> Request {
        let mut request = Request::new(
            self.method,
            format!("{}{}", endpoint.trim_end_matches('/'), self.path),
        )
        .body(self.body.clone());
        for (name, value) in &self.headers {
            request.set_header(name.clone(), value.clone());
        }
        request
    }
}

/// A successful exchange and the endpoint that served it
#[derive(Debug, Clone)]
pub struct Delivery {
    pub endpoint: String,
    pub response: Response,
}

/// Sends templates across regions and endpoints until one succeeds or the
/// retry budget runs out
pub struct RetryingTransport {
    caller: Arc<dyn HttpCaller>,
    domains: Arc<DomainsManager>,
    strategy: RetryStrategy,
    use_https: bool,
    url_resolution: bool,
    hooks: Hooks,
    freeze_policy: Arc<dyn FreezePolicy>,
    logger: Option<Arc<UploadLogger>>,
}

impl std::fmt::Debug for RetryingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingTransport")
            .field("strategy", &self.strategy)
            .field("use_https", &self.use_https)
            .field("url_resolution", &self.url_resolution)
            .field("hooks", &self.hooks)
            .field("logger", &self.logger)
            .finish()
    }
}

impl RetryingTransport {
    pub fn new(config: &Config, caller: Arc<dyn HttpCaller>, domains: Arc<DomainsManager>) -> Self {
        Self {
            caller,
            domains,
            strategy: RetryStrategy::new(config.retries(), config.retry_delay()),
            use_https: config.use_https(),
            url_resolution: config.url_resolution(),
            hooks: Hooks::default(),
            freeze_policy: Arc::new(DefaultFreezePolicy::new(config.domain_freeze_duration())),
            logger: None,
        }
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn freeze_policy(mut self, policy: Arc<dyn FreezePolicy>) -> Self {
        self.freeze_policy = policy;
        self
    }

    pub fn logger(mut self, logger: Option<Arc<UploadLogger>>) -> Self {
        self.logger = logger;
        self
    }

    pub fn caller(&self) -> &Arc<dyn HttpCaller> {
        &self.caller
    }

    pub fn domains(&self) -> &Arc<DomainsManager> {
        &self.domains
    }

    /// Tries each region in order, up to `retries + 1` attempts per region,
    /// rotating through the region's unfrozen endpoints.
    pub async fn send(
        &self,
        regions: &[Region],
        template: &RequestTemplate,
        token: Option<&UploadToken>,
    ) -> Result<Delivery> {
        let mut last_error: Option<UploadError> = None;

        'regions: for region in regions {
            let mut last_tried: Option<usize> = None;
            let mut attempt = 0usize;
            loop {
                let candidates = self.domains.candidates(region, template.purpose, self.use_https);
                if candidates.is_empty() {
                    debug!(region = region.id(), "Region has no endpoints");
                    continue 'regions;
                }
                let entry = next_candidate(&candidates, last_tried);
                let endpoint = entry.url.clone();
                last_tried = Some(entry.priority);

                let retry_kind = match self.exchange(template, &endpoint, attempt, token).await {
                    Ok(response) => return Ok(Delivery { endpoint, response }),
                    Err(Exchange::Unresolved(e)) => {
                        warn!(host = %endpoint, attempt = attempt, error = %e, "Skipping unresolvable endpoint");
                        last_error = Some(e);
                        RetryKind::Retryable
                    }
                    Err(Exchange::Failed(error)) => {
                        warn!(
                            host = %endpoint,
                            attempt = attempt,
                            retry_kind = ?error.retry_kind(),
                            error = %error,
                            "Upload request failed"
                        );
                        let retry_kind = error.retry_kind();
                        match retry_kind {
                            RetryKind::Unretryable => return Err(error.into()),
                            RetryKind::HostUnretryable => {
                                self.freeze_policy
                                    .on_host_failure(&self.domains, &endpoint, &error);
                            }
                            RetryKind::ZoneUnretryable => {
                                last_error = Some(error.into());
                                continue 'regions;
                            }
                            RetryKind::Retryable => {}
                        }
                        last_error = Some(error.into());
                        retry_kind
                    }
                };

                if !self.strategy.should_retry(attempt, retry_kind) {
                    continue 'regions;
                }
                attempt += 1;
                tokio::time::sleep(self.strategy.jittered_delay()).await;
            }
        }

        Err(last_error.unwrap_or_else(|| UploadError::EndpointUnresolved {
            host: String::new(),
            message: "no upload endpoints available".to_string(),
        }))
    }

    /// Resolves `endpoint` if needed, runs one attempt and writes it to the upload log
    async fn exchange(
        &self,
        template: &RequestTemplate,
        endpoint: &str,
        attempt: usize,
        token: Option<&UploadToken>,
    ) -> std::result::Result<Response, Exchange> {
        if self.url_resolution {
            self.domains
                .resolve(endpoint)
                .await
                .map_err(Exchange::Unresolved)?;
        }

        let started = Instant::now();
        let outcome = self.attempt(template, endpoint).await;
        self.record(template, endpoint, attempt, started, &outcome, token)
            .await;
        outcome.map_err(|error| Exchange::Failed(error.with_endpoint(endpoint.to_string())))
    }

    /// One exchange: hooks, the call itself, then status classification
    async fn attempt(
        &self,
        template: &RequestTemplate,
        endpoint: &str,
    ) -> std::result::Result<Response, HttpError> {
        let mut request = template.to_request(endpoint);
        self.hooks.run_before(&mut request).map_err(hook_failure)?;
        let mut response = self.caller.call(&request).await?;
        self.hooks
            .run_after(&request, &mut response)
            .map_err(hook_failure)?;

        if response.is_success() {
            if template.expect_json {
                if let Err(e) = serde_json::from_slice::<serde_json::Value>(&response.body) {
                    return Err(HttpError::new(
                        HttpErrorKind::Json(e.to_string()),
                        RetryKind::Retryable,
                    ));
                }
            }
            return Ok(response);
        }

        let status = response.status;
        let kind = if (300..400).contains(&status) {
            HttpErrorKind::UnexpectedRedirect {
                location: response.header("location").map(str::to_string),
            }
        } else {
            HttpErrorKind::ResponseStatusCode {
                status,
                message: response.error_message(),
            }
        };
        Err(HttpError::new(kind, classify_status(status)))
    }

    /// Appends the attempt to the upload log. Shipping, if due, runs detached.
    async fn record(
        &self,
        template: &RequestTemplate,
        endpoint: &str,
        attempt: usize,
        started: Instant,
        outcome: &std::result::Result<Response, HttpError>,
        token: Option<&UploadToken>,
    ) {
        let Some(logger) = &self.logger else {
            return;
        };
        let mut record = UplogRecord::new(template.up_type, endpoint);
        record.duration_ms = started.elapsed().as_millis() as u64;
        record.retry_count = attempt;
        record.total_size = template.total_size;
        record = match outcome {
            Ok(response) => {
                record.status_code = Some(response.status);
                record.bytes_sent = template.body.len();
                record
            }
            Err(error) => {
                if error.status_code().is_some() {
                    record.bytes_sent = template.body.len();
                }
                record.with_error(error)
            }
        };
        logger.log(&record, token).await;
    }
}

enum Exchange {
    Unresolved(UploadError),
    Failed(HttpError),
}

/// The first candidate after the one tried last, wrapping around
fn next_candidate(candidates: &[DomainEntry], last_tried: Option<usize>) -> &DomainEntry {
    last_tried
        .and_then(|last| candidates.iter().find(|entry| entry.priority > last))
        .unwrap_or(&candidates[0])
}

fn hook_failure(error: HookError) -> HttpError {
    let kind = error.into_kind();
    let retry_kind = classify_error_kind(&kind);
    HttpError::new(kind, retry_kind)
}
