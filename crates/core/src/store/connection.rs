//! Opening the SQLite replica.
//!
//! Every handle runs its statements on tokio-rusqlite's background thread and
//! comes up with WAL journaling and the current schema.

use std::path::Path;

use tokio_rusqlite::Connection;

use super::migrations;
use super::records::ReplicaCollection;
use crate::{CollectionSpec, Error};

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;
     PRAGMA busy_timeout=5000;";

/// Shared handle to the replica database. Cloning shares the connection.
#[derive(Clone, Debug)]
pub struct ReplicaDb {
    pub(crate) conn: Connection,
    schema_version: i64,
}

impl ReplicaDb {
    /// Open (creating if needed) the replica at `path` and bring its schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let conn = Connection::open(path).await.map_err(|e| Error::Database(e.into()))?;
        let db = Self::init(conn).await?;
        tracing::info!(path = %path.display(), schema_version = db.schema_version, "opened replica");
        Ok(db)
    }

    /// Replica that lives only as long as the handle; used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, Error> {
        conn.call(|conn| conn.execute_batch(PRAGMAS)).await?;
        let schema_version = migrations::run(&conn).await?;
        Ok(Self { conn, schema_version })
    }

    /// Schema version after migrations ran at open.
    pub fn schema_version(&self) -> i64 {
        self.schema_version
    }

    /// [`LocalStore`](super::LocalStore) view over one collection.
    pub fn collection(&self, spec: &CollectionSpec) -> ReplicaCollection {
        ReplicaCollection::new(self.clone(), spec)
    }
}
