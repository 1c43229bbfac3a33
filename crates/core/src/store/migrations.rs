//! Versioned schema for the replica database.
//!
//! Applied versions are recorded in `_migrations`; opening a replica applies
//! every newer entry of [`MIGRATIONS`] in order, each in its own transaction.

use tokio_rusqlite::{Connection, params, rusqlite};

use crate::Error;

/// One schema step.
pub(crate) struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Ordered by version; versions never get reused.
pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration { version: 1, name: "records", sql: include_str!("../../migrations/001_records.sql") },
    Migration {
        version: 2,
        name: "records_partition_index",
        sql: include_str!("../../migrations/002_records_partition_index.sql"),
    },
];

/// Apply pending migrations, returning the resulting schema version.
///
/// # Errors
///
/// Returns `Error::MigrationFailed` naming the step whose SQL failed.
pub async fn run(conn: &Connection) -> Result<i64, Error> {
    conn.call(|conn| -> Result<i64, Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let start = current_version(conn)?;
        let mut version = start;
        for migration in MIGRATIONS.iter().filter(|m| m.version > start) {
            let tx = conn.transaction()?;
            tx.execute_batch(migration.sql)
                .map_err(|e| Error::MigrationFailed(format!("{} (v{}): {e}", migration.name, migration.version)))?;
            tx.execute(
                "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, chrono::Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;

            tracing::debug!(version = migration.version, name = migration.name, "applied replica migration");
            version = migration.version;
        }

        Ok(version)
    })
    .await
    .map_err(Error::from)
}

pub(crate) fn current_version(conn: &rusqlite::Connection) -> Result<i64, Error> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))
        .map_err(Error::from)
}
