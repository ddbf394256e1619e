//! Resumable, failover-aware uploads to object storage.
//!
//! Small objects go up in a single form POST, large ones block by block over
//! the `mkblk`/`mkfile` protocol with on-disk progress records. Endpoints that
//! misbehave are frozen for a while and requests rotate to the next one.

pub mod batch;
pub mod config;
pub mod credential;
pub mod domains;
pub mod error;
pub mod etag;
pub mod http;
pub mod logging;
pub mod region;
pub mod time;
pub mod upload;
pub mod upload_token;
pub mod uplog;

pub use batch::{BatchJob, BatchJobBuilder, BatchReport, BatchUploader};
pub use config::{Config, ConfigBuilder};
pub use credential::Credential;
pub use domains::{DomainsManager, DomainsManagerBuilder};
pub use error::{ErrorKind, HttpError, Result, RetryDecision, RetryKind, UploadError};
pub use region::{Region, UpPurpose};
pub use upload::{FileUploader, ResumablePolicy, UploadManager, UploadResponse};
pub use upload_token::{UploadPolicy, UploadPolicyBuilder, UploadToken};
