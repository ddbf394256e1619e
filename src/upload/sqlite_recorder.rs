use super::recorder::{RecordStore, UploadSessionRecord};
use crate::error::{ErrorContext, Result, UploadError};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Upload records kept in a SQLite table, one row per record
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordStore").finish_non_exhaustive()
    }
}

impl SqliteRecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create record database directory")?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Upload record database opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS upload_records (
                id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| UploadError::Config("Upload record database lock poisoned".to_string()))
    }
}

impl RecordStore for SqliteRecordStore {
    fn load(&self, id: &str) -> Result<Option<UploadSessionRecord>> {
        let conn = self.connection()?;
        let content: Option<String> = conn
            .query_row(
                "SELECT record FROM upload_records WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match content.map(|content| serde_json::from_str(&content)) {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => {
                debug!(id = id, error = %e, "Ignoring unreadable upload record row");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn save(&self, record: &UploadSessionRecord) -> Result<()> {
        let content = serde_json::to_string(record)?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO upload_records (id, record, updated_at) VALUES (?, ?, ?)",
            params![record.id, content, record.updated_at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM upload_records WHERE id = ?", params![id])?;
        Ok(())
    }
}
