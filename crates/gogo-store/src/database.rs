//! SQLite handle for the chat store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;
use crate::migrations;

/// How long a statement waits on a locked database file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the SQLite connection. The schema is migrated before the handle is
/// returned.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create the store at `path`, creating missing parent
    /// directories.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        migrations::run_migrations(&mut conn)?;
        tracing::info!(path = %path.display(), "chat store ready");

        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}
