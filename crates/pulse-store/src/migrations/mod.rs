//! Schema migrations, tracked with `PRAGMA user_version`.
//!
//! [`MIGRATIONS`] is ordered by version. Opening a database applies every
//! entry above the stored version, each in its own transaction together with
//! the version bump, so a failed step leaves the previous schema intact.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

struct Migration {
    version: u32,
    name: &'static str,
    up: fn(&Connection) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "v001_initial",
    up: v001_initial::up,
}];

/// Highest version known to this build.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let stored: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let target = latest_version();

    if stored > target {
        return Err(StoreError::Migration(format!(
            "database schema v{stored} is newer than this build (v{target})"
        )));
    }
    if stored == target {
        tracing::debug!(version = stored, "schema up to date");
        return Ok(());
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > stored) {
        tracing::info!(version = migration.version, name = migration.name, "applying migration");

        let tx = conn.unchecked_transaction()?;
        (migration.up)(&tx)
            .map_err(|e| StoreError::Migration(format!("{}: {e}", migration.name)))?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;
    }

    Ok(())
}
