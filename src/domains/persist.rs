use crate::error::{ErrorContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainsSnapshot {
    #[serde(default)]
    pub frozen: Vec<FrozenHost>,
    #[serde(default)]
    pub resolutions: Vec<ResolvedHost>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenHost {
    pub host: String,
    pub frozen_at: DateTime<Utc>,
    pub frozen_until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedHost {
    pub host: String,
    pub addrs: Vec<IpAddr>,
    pub cached_at: DateTime<Utc>,
}

/// Where `DomainsManager::persist` writes to
pub trait PersistSink: Send + Sync {
    fn save(&self, snapshot: &DomainsSnapshot) -> Result<()>;

    /// `Ok(None)` when nothing was persisted yet
    fn load(&self) -> Result<Option<DomainsSnapshot>>;
}

/// JSON file sink; writes go to a temp file that is renamed over the target
#[derive(Debug, Clone)]
pub struct FilePersistSink {
    path: PathBuf,
}

impl FilePersistSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistSink for FilePersistSink {
    fn save(&self, snapshot: &DomainsSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create domain state directory")?;
        }
        let content = serde_json::to_vec_pretty(snapshot)?;
        write_atomically(&self.path, &content)
    }

    fn load(&self) -> Result<Option<DomainsSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read(&self.path).context("Failed to read domain state")?;
        Ok(Some(serde_json::from_slice(&content)?))
    }
}

/// Writes `content` next to `path` under a unique name, then renames it into place
pub(crate) fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}
