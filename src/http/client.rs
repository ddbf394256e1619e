use super::{classify_error_kind, Body, HttpCaller, LowSpeedMonitor, Method, Request, Response};
use crate::config::Config;
use crate::domains::{DomainsManager, DomainsResolver};
use crate::error::{HttpError, HttpErrorKind, Result, TransportCode, UploadError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_LENGTH;
use reqwest::multipart::{Form, Part};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Request bodies are streamed in chunks of this size so the speed monitor sees progress
const STREAM_CHUNK_SIZE: usize = 1 << 16;

/// `HttpCaller` backed by reqwest
#[derive(Debug, Clone)]
pub struct ReqwestCaller {
    client: reqwest::Client,
    low_speed_limit: u64,
    low_speed_time: Duration,
}

impl ReqwestCaller {
    pub fn new(config: &Config) -> Result<Self> {
        Self::build(config, None)
    }

    /// Resolves hosts through `domains` when URL resolution is enabled
    pub fn with_domains(config: &Config, domains: Arc<DomainsManager>) -> Result<Self> {
        Self::build(config, Some(domains))
    }

    fn build(config: &Config, domains: Option<Arc<DomainsManager>>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(config.user_agent())
            .redirect(reqwest::redirect::Policy::none());

        if let Some(domains) = domains.filter(|_| config.url_resolution()) {
            builder = builder.dns_resolver(Arc::new(DomainsResolver::new(domains)));
        }

        let client = builder
            .build()
            .map_err(|e| UploadError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            low_speed_limit: config.low_speed_limit(),
            low_speed_time: config.low_speed_time(),
        })
    }

    async fn exchange(
        &self,
        request: &Request,
        counter: Arc<AtomicU64>,
    ) -> std::result::Result<Response, HttpError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &request.body {
            Body::Empty => builder,
            Body::Bytes(data) => builder
                .header(CONTENT_LENGTH, data.len())
                .body(counted_body(data.clone(), Arc::clone(&counter))),
            Body::Form(form) => {
                let mut multipart = Form::new();
                for (name, value) in &form.fields {
                    multipart = multipart.text(name.clone(), value.clone());
                }
                if let Some(file) = &form.file {
                    let part = Part::stream_with_length(
                        counted_body(file.data.clone(), Arc::clone(&counter)),
                        file.data.len() as u64,
                    )
                    .file_name(file.file_name.clone())
                    .mime_str(&file.mime_type)
                    .map_err(map_reqwest_error)?;
                    multipart = multipart.part(file.field_name.clone(), part);
                }
                builder.multipart(multipart)
            }
        };

        let mut response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            body.extend_from_slice(&chunk);
        }

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl HttpCaller for ReqwestCaller {
    async fn call(&self, request: &Request) -> std::result::Result<Response, HttpError> {
        let monitor = LowSpeedMonitor::new(self.low_speed_limit, self.low_speed_time);
        let exchange = self.exchange(request, monitor.counter());

        tokio::select! {
            result = exchange => result,
            stalled = monitor.watch() => {
                debug!(url = %request.url, "Aborting stalled transfer");
                Err(stalled)
            }
        }
    }
}

fn counted_body(data: Bytes, counter: Arc<AtomicU64>) -> reqwest::Body {
    let chunks: Vec<Bytes> = (0..data.len())
        .step_by(STREAM_CHUNK_SIZE)
        .map(|start| data.slice(start..(start + STREAM_CHUNK_SIZE).min(data.len())))
        .collect();
    let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok::<Bytes, std::io::Error>(chunk)
    }));
    reqwest::Body::wrap_stream(stream)
}

fn map_reqwest_error(error: reqwest::Error) -> HttpError {
    let kind = if error.is_redirect() {
        HttpErrorKind::UnexpectedRedirect {
            location: error.url().map(|url| url.to_string()),
        }
    } else {
        let code = if error.is_builder() {
            TransportCode::Builder
        } else if error.is_timeout() {
            TransportCode::Timeout
        } else if error.is_connect() {
            TransportCode::Connect
        } else if error.is_body() {
            TransportCode::Body
        } else if error.is_decode() {
            TransportCode::Decode
        } else if error.is_request() {
            TransportCode::Request
        } else {
            TransportCode::Other
        };
        HttpErrorKind::Transport {
            code,
            message: error.to_string(),
        }
    };
    let retry_kind = classify_error_kind(&kind);
    HttpError::new(kind, retry_kind)
}
