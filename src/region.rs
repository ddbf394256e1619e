//! Storage regions and their upload endpoints.

use crate::error::{HttpError, HttpErrorKind, Result, RetryKind};
use crate::http::{HttpCaller, Method, Request};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Which upload protocol an endpoint will serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpPurpose {
    /// Single multipart form POST
    Direct,
    /// `mkblk`/`mkfile` resumable protocol
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    id: String,
    direct_hosts: Vec<String>,
    chunked_hosts: Vec<String>,
}

const BUILTIN_REGIONS: &[(&str, &[&str], &[&str])] = &[
    (
        "z0",
        &["up.qiniup.com", "upload.qiniup.com", "up-jjh.qiniup.com"],
        &["upload.qiniup.com", "up.qiniup.com", "up-jjh.qiniup.com"],
    ),
    (
        "z1",
        &["up-z1.qiniup.com", "upload-z1.qiniup.com"],
        &["upload-z1.qiniup.com", "up-z1.qiniup.com"],
    ),
    (
        "z2",
        &["up-z2.qiniup.com", "upload-z2.qiniup.com"],
        &["upload-z2.qiniup.com", "up-z2.qiniup.com"],
    ),
    (
        "na0",
        &["up-na0.qiniup.com", "upload-na0.qiniup.com"],
        &["upload-na0.qiniup.com", "up-na0.qiniup.com"],
    ),
    (
        "as0",
        &["up-as0.qiniup.com", "upload-as0.qiniup.com"],
        &["upload-as0.qiniup.com", "up-as0.qiniup.com"],
    ),
];

impl Region {
    /// A region with caller-supplied hosts. Hosts may carry a scheme, which then wins
    /// over the `use_https` setting.
    pub fn custom(
        id: impl Into<String>,
        direct_hosts: Vec<String>,
        chunked_hosts: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            direct_hosts,
            chunked_hosts,
        }
    }

    pub fn by_id(id: &str) -> Option<Self> {
        BUILTIN_REGIONS
            .iter()
            .find(|(region_id, _, _)| *region_id == id)
            .map(|(region_id, direct, chunked)| Self {
                id: region_id.to_string(),
                direct_hosts: direct.iter().map(|h| h.to_string()).collect(),
                chunked_hosts: chunked.iter().map(|h| h.to_string()).collect(),
            })
    }

    pub fn all_builtin() -> Vec<Self> {
        BUILTIN_REGIONS
            .iter()
            .filter_map(|(id, _, _)| Self::by_id(id))
            .collect()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hosts(&self, purpose: UpPurpose) -> &[String] {
        match purpose {
            UpPurpose::Direct => &self.direct_hosts,
            UpPurpose::Chunked => &self.chunked_hosts,
        }
    }

    /// Endpoint base URLs in priority order
    pub fn urls(&self, purpose: UpPurpose, use_https: bool) -> Vec<String> {
        self.hosts(purpose)
            .iter()
            .map(|host| {
                if host.starts_with("http://") || host.starts_with("https://") {
                    host.trim_end_matches('/').to_string()
                } else if use_https {
                    format!("https://{}", host)
                } else {
                    format!("http://{}", host)
                }
            })
            .collect()
    }

    /// Asks the bucket-configuration service which region serves `bucket`.
    pub async fn query(
        caller: &dyn HttpCaller,
        uc_url: &str,
        access_key: &str,
        bucket: &str,
    ) -> Result<Vec<Region>> {
        let url = format!(
            "{}/v2/query?ak={}&bucket={}",
            uc_url.trim_end_matches('/'),
            access_key,
            bucket
        );
        debug!(bucket = bucket, url = %url, "Querying bucket region");

        let request = Request::new(Method::Get, url.clone());
        let response = caller.call(&request).await.map_err(|e| e.with_endpoint(uc_url))?;
        if !(200..300).contains(&response.status) {
            return Err(HttpError::unretryable(HttpErrorKind::ResponseStatusCode {
                status: response.status,
                message: String::from_utf8_lossy(&response.body).into_owned(),
            })
            .with_endpoint(uc_url)
            .into());
        }

        let body: QueryResponse = serde_json::from_slice(&response.body).map_err(|e| {
            HttpError::new(HttpErrorKind::Json(e.to_string()), RetryKind::Retryable)
                .with_endpoint(uc_url)
        })?;

        let mut hosts = Vec::new();
        for group in [&body.up.acc, &body.up.src] {
            for host in group.main.iter().chain(group.backup.iter()) {
                if !hosts.contains(host) {
                    hosts.push(host.clone());
                }
            }
        }
        if hosts.is_empty() {
            warn!(bucket = bucket, "Region query returned no upload hosts");
            return Ok(Vec::new());
        }

        let id = body.region.unwrap_or_else(|| "queried".to_string());
        Ok(vec![Region::custom(id, hosts.clone(), hosts)])
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    region: Option<String>,
    up: QueryUpHosts,
}

#[derive(Debug, Default, Deserialize)]
struct QueryUpHosts {
    #[serde(default)]
    acc: HostGroup,
    #[serde(default)]
    src: HostGroup,
}

#[derive(Debug, Default, Deserialize)]
struct HostGroup {
    #[serde(default)]
    main: Vec<String>,
    #[serde(default)]
    backup: Vec<String>,
}
