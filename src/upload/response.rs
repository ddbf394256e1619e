use crate::error::{Result, UploadError};
use serde_json::Value;

/// The JSON document the storage service answers a finished upload with
#[derive(Debug, Clone, PartialEq)]
pub struct UploadResponse {
    value: Value,
}

impl UploadResponse {
    pub(crate) fn from_slice(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)?;
        if !value.is_object() {
            return Err(UploadError::Integrity(format!(
                "Upload response is not a JSON object: {}",
                value
            )));
        }
        Ok(Self { value })
    }

    /// Object key, absent when the token's return body omits it
    pub fn key(&self) -> Option<&str> {
        self.value.get("key").and_then(Value::as_str)
    }

    /// Content etag
    pub fn hash(&self) -> Option<&str> {
        self.value.get("hash").and_then(Value::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.value.get(field)
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

impl From<UploadResponse> for Value {
    fn from(response: UploadResponse) -> Self {
        response.value
    }
}
