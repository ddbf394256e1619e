//! Upload tokens.
//!
//! A token is `access_key:signature:encoded_policy`. The transport only ever
//! sees its string form (`Authorization: UpToken <token>` or the `token` form
//! field); the policy is kept alongside so callers can inspect scope and
//! deadline.

mod policy;

pub use policy::{UploadPolicy, UploadPolicyBuilder};

use crate::config::Config;
use crate::credential::Credential;
use crate::error::{Result, UploadError};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct UploadToken {
    token: String,
    access_key: String,
    policy: UploadPolicy,
}

impl UploadToken {
    /// Signs `policy`. Fails when the policy names no bucket or is already expired.
    pub fn issue(policy: UploadPolicy, credential: &Credential) -> Result<Self> {
        if policy.bucket().is_empty() {
            return Err(UploadError::InvalidPolicy(
                "Upload policy scope has no bucket".to_string(),
            ));
        }
        let now = Utc::now().timestamp();
        if policy.deadline() <= now {
            return Err(UploadError::InvalidPolicy(format!(
                "Upload policy deadline {} is not after now ({})",
                policy.deadline(),
                now
            )));
        }

        let json = policy.to_json()?;
        let token = credential.sign_with_data(json.as_bytes());
        Ok(Self {
            token,
            access_key: credential.access_key().to_string(),
            policy,
        })
    }

    /// Token for any key in `bucket`, valid for the configured token lifetime
    pub fn for_bucket(bucket: &str, credential: &Credential, config: &Config) -> Result<Self> {
        let policy = UploadPolicyBuilder::new_for_bucket(bucket, config.token_lifetime()).build();
        Self::issue(policy, credential)
    }

    /// Recovers access key and policy from a token string. The signature is not checked.
    pub fn parse(token: &str) -> Result<Self> {
        let mut parts = token.split(':');
        let (access_key, signature, encoded) = match (parts.next(), parts.next(), parts.next()) {
            (Some(ak), Some(sig), Some(encoded)) if parts.next().is_none() => (ak, sig, encoded),
            _ => {
                return Err(UploadError::InvalidPolicy(
                    "Upload token must have three colon separated parts".to_string(),
                ))
            }
        };
        if access_key.is_empty() || signature.is_empty() {
            return Err(UploadError::InvalidPolicy(
                "Upload token has an empty access key or signature".to_string(),
            ));
        }

        let decoded = URL_SAFE
            .decode(encoded)
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
            .map_err(|e| UploadError::InvalidPolicy(format!("Bad policy encoding: {}", e)))?;
        let policy: UploadPolicy = serde_json::from_slice(&decoded)
            .map_err(|e| UploadError::InvalidPolicy(format!("Bad policy document: {}", e)))?;

        Ok(Self {
            token: token.to_string(),
            access_key: access_key.to_string(),
            policy,
        })
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn bucket(&self) -> &str {
        self.policy.bucket()
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub(crate) fn authorization(&self) -> String {
        format!("UpToken {}", self.token)
    }
}

impl fmt::Display for UploadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

impl FromStr for UploadToken {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
