//! Process-wide tracing setup.

use crate::config::ensure_dir;
use crate::error::{Result, UploadError};
use std::path::Path;
use std::sync::{LazyLock, Mutex, Once};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_FILE_NAME: &str = "uploader.log";

static LOGGER_INITIALIZED: Once = Once::new();

// The non-blocking writer stops flushing once its guard is dropped
static FILE_APPENDER_GUARD: LazyLock<Mutex<Option<WorkerGuard>>> =
    LazyLock::new(|| Mutex::new(None));

/// Installs a compact console layer and a file layer writing to
/// `logs_dir/uploader.log`. Both honor `RUST_LOG` and default to `info`.
/// Only the first call has any effect.
pub fn init_logging(logs_dir: &Path) -> Result<()> {
    ensure_dir(logs_dir)?;

    let mut outcome = Ok(());
    LOGGER_INITIALIZED.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let console_layer = fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_filter(env_filter.clone());

        let file_appender = tracing_appender::rolling::never(logs_dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        if let Ok(mut guard_slot) = FILE_APPENDER_GUARD.lock() {
            *guard_slot = Some(guard);
        }

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_filter(env_filter);

        outcome = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| UploadError::Config(format!("Failed to install logger: {}", e)));
    });

    outcome
}
