use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, UploadError>;

/// Coarse classification of every failure the engine can surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    IoError,
    OsError,
    UnexpectedRedirect,
    UserCancelled,
    JsonError,
    ResponseStatusCode,
    TransportError,
    IntegrityError,
    EndpointUnresolved,
    CapacityExceeded,
    InvalidPolicy,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::IoError => "IOError",
            ErrorKind::OsError => "OSError",
            ErrorKind::UnexpectedRedirect => "UnexpectedRedirect",
            ErrorKind::UserCancelled => "UserCancelled",
            ErrorKind::JsonError => "JSONError",
            ErrorKind::ResponseStatusCode => "ResponseStatusCode",
            ErrorKind::TransportError => "TransportError",
            ErrorKind::IntegrityError => "IntegrityError",
            ErrorKind::EndpointUnresolved => "EndpointUnresolvedError",
            ErrorKind::CapacityExceeded => "CapacityExceededError",
            ErrorKind::InvalidPolicy => "InvalidPolicyError",
        };
        f.write_str(name)
    }
}

/// What the caller may do after a failed exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryKind {
    /// Transient failure, safe to try again
    Retryable,
    /// The endpoint itself is unhealthy; rotate away from it
    HostUnretryable,
    /// Every endpoint of the region is affected; move to the next region
    ZoneUnretryable,
    /// Retrying cannot help
    Unretryable,
}

/// Classification attached to every transport-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryDecision {
    pub kind: ErrorKind,
    pub retry_kind: RetryKind,
}

impl RetryDecision {
    pub fn new(kind: ErrorKind, retry_kind: RetryKind) -> Self {
        Self { kind, retry_kind }
    }

    pub fn is_retry_safe(&self) -> bool {
        self.retry_kind != RetryKind::Unretryable
    }
}

/// Underlying HTTP client failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportCode {
    Connect,
    Timeout,
    LowSpeed,
    Request,
    Body,
    Decode,
    Builder,
    Other,
}

/// The fixed set of failure kinds an exchange (or a hook) can produce
#[derive(Debug, Error)]
pub enum HttpErrorKind {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OS error {code}: {message}")]
    Os { code: i32, message: String },

    #[error("Unexpected redirect to {}", location.as_deref().unwrap_or("<unknown>"))]
    UnexpectedRedirect { location: Option<String> },

    #[error("Cancelled by user: {0}")]
    UserCancelled(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Response status {status}: {message}")]
    ResponseStatusCode { status: u16, message: String },

    #[error("Transport error ({code:?}): {message}")]
    Transport { code: TransportCode, message: String },
}

impl HttpErrorKind {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            HttpErrorKind::Io(_) => ErrorKind::IoError,
            HttpErrorKind::Os { .. } => ErrorKind::OsError,
            HttpErrorKind::UnexpectedRedirect { .. } => ErrorKind::UnexpectedRedirect,
            HttpErrorKind::UserCancelled(_) => ErrorKind::UserCancelled,
            HttpErrorKind::Json(_) => ErrorKind::JsonError,
            HttpErrorKind::ResponseStatusCode { .. } => ErrorKind::ResponseStatusCode,
            HttpErrorKind::Transport { .. } => ErrorKind::TransportError,
        }
    }
}

/// A failed exchange, annotated with its endpoint and retry classification
#[derive(Debug, Error)]
pub struct HttpError {
    #[source]
    kind: HttpErrorKind,
    decision: RetryDecision,
    endpoint: Option<String>,
}

impl HttpError {
    pub fn new(kind: HttpErrorKind, retry_kind: RetryKind) -> Self {
        let decision = RetryDecision::new(kind.error_kind(), retry_kind);
        Self {
            kind,
            decision,
            endpoint: None,
        }
    }

    pub fn unretryable(kind: HttpErrorKind) -> Self {
        Self::new(kind, RetryKind::Unretryable)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn kind(&self) -> &HttpErrorKind {
        &self.kind
    }

    pub fn decision(&self) -> RetryDecision {
        self.decision
    }

    pub fn retry_kind(&self) -> RetryKind {
        self.decision.retry_kind
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.kind {
            HttpErrorKind::ResponseStatusCode { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:?}]", self.kind, self.decision.retry_kind)?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, " at {}", endpoint)?;
        }
        Ok(())
    }
}

/// Upload engine errors
#[derive(Debug, Error)]
pub enum UploadError {
    /// A request failed after the retry budget was spent, or could not be retried
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    /// Local data and the acknowledged data disagree
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// DNS resolution kept failing
    #[error("Endpoint unresolved: {host}: {message}")]
    EndpointUnresolved { host: String, message: String },

    /// The batch queue bound was reached
    #[error("Capacity exceeded: queue holds at most {limit} jobs")]
    CapacityExceeded { limit: usize },

    /// Upload policy or token is unusable
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Upload record database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Http(err) => err.decision().kind,
            UploadError::Integrity(_) => ErrorKind::IntegrityError,
            UploadError::EndpointUnresolved { .. } => ErrorKind::EndpointUnresolved,
            UploadError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            UploadError::InvalidPolicy(_) => ErrorKind::InvalidPolicy,
            UploadError::Config(_) | UploadError::Io(_) | UploadError::Database(_) => {
                ErrorKind::IoError
            }
            UploadError::Json(_) => ErrorKind::JsonError,
        }
    }

    /// Retry classification, present only for transport-level failures
    pub fn retry_decision(&self) -> Option<RetryDecision> {
        match self {
            UploadError::Http(err) => Some(err.decision()),
            _ => None,
        }
    }
}

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn context(self, msg: &str) -> Result<T>;
}

impl<T, E: Into<UploadError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| match e.into() {
            UploadError::Config(s) => UploadError::Config(format!("{}: {}", msg, s)),
            UploadError::InvalidPolicy(s) => UploadError::InvalidPolicy(format!("{}: {}", msg, s)),
            UploadError::Integrity(s) => UploadError::Integrity(format!("{}: {}", msg, s)),
            UploadError::Io(e) => {
                UploadError::Io(std::io::Error::new(e.kind(), format!("{}: {}", msg, e)))
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UploadError::InvalidPolicy("bucket is empty".to_string());
        assert_eq!(err.to_string(), "Invalid policy: bucket is empty");
    }

    #[test]
    fn test_http_error_carries_decision() {
        let err = HttpError::new(
            HttpErrorKind::ResponseStatusCode {
                status: 503,
                message: "busy".to_string(),
            },
            RetryKind::HostUnretryable,
        )
        .with_endpoint("https://up.example.com");

        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.endpoint(), Some("https://up.example.com"));
        assert_eq!(err.decision().kind, ErrorKind::ResponseStatusCode);
        assert!(err.decision().is_retry_safe());

        let upload_err: UploadError = err.into();
        assert_eq!(upload_err.kind(), ErrorKind::ResponseStatusCode);
        assert!(upload_err.retry_decision().is_some());
    }

    #[test]
    fn test_unretryable_is_not_retry_safe() {
        let err = HttpError::unretryable(HttpErrorKind::UserCancelled("stop".to_string()));
        assert!(!err.decision().is_retry_safe());
        assert_eq!(err.decision().kind, ErrorKind::UserCancelled);
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        let err = result.context("Failed to read config file").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::IoError);
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
