use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::fmt;

type HmacSha1 = Hmac<Sha1>;

/// Access/secret key pair used to sign upload tokens
#[derive(Clone)]
pub struct Credential {
    access_key: String,
    secret_key: String,
}

impl Credential {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// `access_key:urlsafe_b64(hmac_sha1(secret_key, data))`
    pub fn sign(&self, data: &[u8]) -> String {
        format!("{}:{}", self.access_key, self.digest(data))
    }

    /// Encodes `data`, then signs the encoded form.
    /// Returns `access_key:signature:encoded_data`.
    pub fn sign_with_data(&self, data: &[u8]) -> String {
        let encoded = URL_SAFE.encode(data);
        format!("{}:{}", self.sign(encoded.as_bytes()), encoded)
    }

    fn digest(&self, data: &[u8]) -> String {
        // HMAC accepts keys of any length
        let mut mac = match HmacSha1::new_from_slice(self.secret_key.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA1 takes keys of any size"),
        };
        mac.update(data);
        URL_SAFE.encode(mac.finalize().into_bytes())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}
