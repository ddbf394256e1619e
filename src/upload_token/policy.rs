//! Upload policy document and its builder.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Flat JSON policy the storage service enforces for one upload token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPolicy {
    pub(crate) scope: String,
    pub(crate) deadline: i64,
    #[serde(rename = "isPrefixalScope", skip_serializing_if = "Option::is_none")]
    pub(crate) is_prefixal_scope: Option<u8>,
    #[serde(rename = "insertOnly", skip_serializing_if = "Option::is_none")]
    pub(crate) insert_only: Option<u8>,
    #[serde(rename = "fileType", skip_serializing_if = "Option::is_none")]
    pub(crate) file_type: Option<u8>,
    #[serde(rename = "fsizeMin", skip_serializing_if = "Option::is_none")]
    pub(crate) file_size_min: Option<u64>,
    #[serde(rename = "fsizeLimit", skip_serializing_if = "Option::is_none")]
    pub(crate) file_size_max: Option<u64>,
    #[serde(rename = "returnUrl", skip_serializing_if = "Option::is_none")]
    pub(crate) return_url: Option<String>,
    #[serde(rename = "returnBody", skip_serializing_if = "Option::is_none")]
    pub(crate) return_body: Option<String>,
    #[serde(rename = "callbackUrl", skip_serializing_if = "Option::is_none")]
    pub(crate) callback_url: Option<String>,
    #[serde(rename = "callbackHost", skip_serializing_if = "Option::is_none")]
    pub(crate) callback_host: Option<String>,
    #[serde(rename = "callbackBody", skip_serializing_if = "Option::is_none")]
    pub(crate) callback_body: Option<String>,
    #[serde(rename = "callbackBodyType", skip_serializing_if = "Option::is_none")]
    pub(crate) callback_body_type: Option<String>,
    #[serde(rename = "mimeLimit", skip_serializing_if = "Option::is_none")]
    pub(crate) mime_limit: Option<String>,
    #[serde(rename = "saveKey", skip_serializing_if = "Option::is_none")]
    pub(crate) save_key: Option<String>,
    #[serde(rename = "forceSaveKey", skip_serializing_if = "Option::is_none")]
    pub(crate) force_save_key: Option<bool>,
    #[serde(rename = "detectMime", skip_serializing_if = "Option::is_none")]
    pub(crate) detect_mime: Option<u8>,
}

impl UploadPolicy {
    /// Bucket part of the scope
    pub fn bucket(&self) -> &str {
        self.scope.split(':').next().unwrap_or_default()
    }

    /// Key (or key prefix) part of the scope, if any
    pub fn key(&self) -> Option<&str> {
        self.scope.split_once(':').map(|(_, key)| key)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn is_prefixal_scope(&self) -> bool {
        self.is_prefixal_scope == Some(1)
    }

    /// Absolute expiry, epoch seconds
    pub fn deadline(&self) -> i64 {
        self.deadline
    }

    pub fn is_insert_only(&self) -> bool {
        self.insert_only.unwrap_or(0) > 0
    }

    pub fn is_infrequent_storage(&self) -> bool {
        self.file_type == Some(1)
    }

    pub fn file_size_limits(&self) -> (Option<u64>, Option<u64>) {
        (self.file_size_min, self.file_size_max)
    }

    pub fn return_url(&self) -> Option<&str> {
        self.return_url.as_deref()
    }

    pub fn return_body(&self) -> Option<&str> {
        self.return_body.as_deref()
    }

    pub fn callback_urls(&self) -> Vec<&str> {
        self.callback_url
            .as_deref()
            .map(|urls| urls.split(' ').filter(|url| !url.is_empty()).collect())
            .unwrap_or_default()
    }

    pub fn callback_host(&self) -> Option<&str> {
        self.callback_host.as_deref()
    }

    pub fn callback_body(&self) -> Option<&str> {
        self.callback_body.as_deref()
    }

    pub fn callback_body_type(&self) -> Option<&str> {
        self.callback_body_type.as_deref()
    }

    pub fn mime_limit(&self) -> Option<&str> {
        self.mime_limit.as_deref()
    }

    pub fn save_key(&self) -> Option<&str> {
        self.save_key.as_deref()
    }

    pub fn is_save_key_forced(&self) -> bool {
        self.force_save_key.unwrap_or(false)
    }

    pub fn is_mime_detection_enabled(&self) -> bool {
        self.detect_mime.unwrap_or(1) > 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Builds an immutable `UploadPolicy`
#[derive(Debug, Clone)]
pub struct UploadPolicyBuilder {
    inner: UploadPolicy,
}

impl UploadPolicyBuilder {
    fn with_scope(scope: String, lifetime: Duration) -> Self {
        let deadline = Utc::now().timestamp().saturating_add(lifetime.as_secs() as i64);
        Self {
            inner: UploadPolicy {
                scope,
                deadline,
                is_prefixal_scope: None,
                insert_only: None,
                file_type: None,
                file_size_min: None,
                file_size_max: None,
                return_url: None,
                return_body: None,
                callback_url: None,
                callback_host: None,
                callback_body: None,
                callback_body_type: None,
                mime_limit: None,
                save_key: None,
                force_save_key: None,
                detect_mime: None,
            },
        }
    }

    /// Any key in the bucket
    pub fn new_for_bucket(bucket: impl Into<String>, lifetime: Duration) -> Self {
        Self::with_scope(bucket.into(), lifetime)
    }

    /// Exactly one key in the bucket
    pub fn new_for_object(
        bucket: impl Into<String>,
        key: impl AsRef<str>,
        lifetime: Duration,
    ) -> Self {
        Self::with_scope(format!("{}:{}", bucket.into(), key.as_ref()), lifetime)
    }

    /// Every key starting with `prefix`
    pub fn new_for_objects_with_prefix(
        bucket: impl Into<String>,
        prefix: impl AsRef<str>,
        lifetime: Duration,
    ) -> Self {
        let mut builder =
            Self::with_scope(format!("{}:{}", bucket.into(), prefix.as_ref()), lifetime);
        builder.inner.is_prefixal_scope = Some(1);
        builder
    }

    pub fn deadline_at(&mut self, deadline_epoch_secs: i64) -> &mut Self {
        self.inner.deadline = deadline_epoch_secs;
        self
    }

    pub fn insert_only(&mut self) -> &mut Self {
        self.inner.insert_only = Some(1);
        self
    }

    pub fn overwritable(&mut self) -> &mut Self {
        self.inner.insert_only = None;
        self
    }

    pub fn infrequent_storage(&mut self) -> &mut Self {
        self.inner.file_type = Some(1);
        self
    }

    pub fn standard_storage(&mut self) -> &mut Self {
        self.inner.file_type = None;
        self
    }

    pub fn file_size_min(&mut self, size: u64) -> &mut Self {
        self.inner.file_size_min = Some(size);
        self
    }

    pub fn file_size_max(&mut self, size: u64) -> &mut Self {
        self.inner.file_size_max = Some(size);
        self
    }

    pub fn return_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.inner.return_url = Some(url.into());
        self
    }

    pub fn return_body(&mut self, body: impl Into<String>) -> &mut Self {
        self.inner.return_body = Some(body.into());
        self
    }

    /// Ask the service to POST `body` to one of `urls` after the upload.
    /// Empty `host` and `body_type` are left out of the policy.
    pub fn callback(
        &mut self,
        urls: &[impl AsRef<str>],
        host: impl Into<String>,
        body: impl Into<String>,
        body_type: impl Into<String>,
    ) -> &mut Self {
        let urls = urls
            .iter()
            .map(|url| url.as_ref())
            .collect::<Vec<_>>()
            .join(" ");
        let host = host.into();
        let body_type = body_type.into();
        self.inner.callback_url = Some(urls);
        self.inner.callback_host = (!host.is_empty()).then_some(host);
        self.inner.callback_body = Some(body.into());
        self.inner.callback_body_type = (!body_type.is_empty()).then_some(body_type);
        self
    }

    /// Semicolon separated mime patterns, `!` prefix to deny
    pub fn mime_limit(&mut self, content_types: impl Into<String>) -> &mut Self {
        self.inner.mime_limit = Some(content_types.into());
        self
    }

    pub fn save_key(&mut self, template: impl Into<String>, force: bool) -> &mut Self {
        self.inner.save_key = Some(template.into());
        self.inner.force_save_key = force.then_some(true);
        self
    }

    pub fn disable_mime_detection(&mut self) -> &mut Self {
        self.inner.detect_mime = Some(0);
        self
    }

    pub fn enable_mime_detection(&mut self) -> &mut Self {
        self.inner.detect_mime = None;
        self
    }

    pub fn build(&self) -> UploadPolicy {
        self.inner.clone()
    }
}
