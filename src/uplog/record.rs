use crate::error::{ErrorKind, HttpError};
use serde::{Deserialize, Serialize};

/// Which exchange a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpType {
    Form,
    Mkblk,
    Mkfile,
}

/// One line of the upload log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplogRecord {
    /// Epoch milliseconds
    pub timestamp: i64,
    pub up_type: UpType,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    pub retry_count: usize,
    pub bytes_sent: u64,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl UplogRecord {
    pub fn new(up_type: UpType, endpoint: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            up_type,
            endpoint: endpoint.into(),
            status_code: None,
            duration_ms: 0,
            retry_count: 0,
            bytes_sent: 0,
            total_size: 0,
            error_kind: None,
            error_message: None,
        }
    }

    pub fn with_error(mut self, error: &HttpError) -> Self {
        self.status_code = error.status_code().or(self.status_code);
        self.error_kind = Some(error.decision().kind);
        self.error_message = Some(error.kind().to_string());
        self
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HttpErrorKind, RetryKind};

    #[test]
    fn test_record_line() {
        let mut record = UplogRecord::new(UpType::Mkblk, "https://up.example.com");
        record.status_code = Some(200);
        record.bytes_sent = 4;

        let line = record.to_line().unwrap();
        assert!(line.contains("\"up_type\":\"mkblk\""));
        assert!(line.contains("\"status_code\":200"));
        assert!(!line.contains("error_kind"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_record_with_error() {
        let error = HttpError::new(
            HttpErrorKind::ResponseStatusCode {
                status: 503,
                message: "busy".to_string(),
            },
            RetryKind::HostUnretryable,
        );
        let record = UplogRecord::new(UpType::Form, "https://up.example.com").with_error(&error);

        assert_eq!(record.status_code, Some(503));
        assert_eq!(record.error_kind, Some(ErrorKind::ResponseStatusCode));
        assert!(record.error_message.unwrap().contains("busy"));
    }
}
