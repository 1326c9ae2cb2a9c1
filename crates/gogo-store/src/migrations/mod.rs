//! Schema migrations, applied in order and recorded in `user_version`.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = fn(&Connection) -> rusqlite::Result<()>;

/// Every migration with the schema version it produces.
const MIGRATIONS: &[(u32, &str, Migration)] = &[(1, "v001_initial", v001_initial::up)];

/// Bring the schema up to the newest version. Each step commits together
/// with its version bump.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let target = MIGRATIONS.last().map(|(v, _, _)| *v).unwrap_or_default();

    if current >= target {
        tracing::debug!(version = current, "schema up to date");
        return Ok(());
    }

    for (version, name, up) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(version, name, "applying migration");
        let tx = conn.transaction()?;
        up(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}
