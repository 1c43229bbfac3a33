//! Local replica stores.
//!
//! The sync layer writes through [`LocalStore`] only: keyed upserts, patches and
//! deletes, so concurrent streams converge with last-applied-wins. Reads are for
//! rendering and for serving cached searches, never for sync decisions.
//!
//! Two implementations are provided:
//! - [`MemoryStore`], a map behind a lock
//! - [`ReplicaCollection`], one collection of the SQLite-backed [`ReplicaDb`]

pub mod connection;
pub mod migrations;
pub mod records;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::{Error, Predicate, Record};

pub use connection::ReplicaDb;
pub use records::ReplicaCollection;

/// Keyed record collection the sync layer writes into.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Insert a record, replacing any existing record with the same id.
    async fn insert(&self, record: Record) -> Result<(), Error>;

    /// Overlay `patch` onto the record `id`, inserting it if absent.
    async fn update(&self, id: &str, patch: &Map<String, Value>) -> Result<(), Error>;

    /// Remove the record `id`; absent ids are ignored.
    async fn delete(&self, id: &str) -> Result<(), Error>;

    async fn get(&self, id: &str) -> Result<Option<Record>, Error>;

    /// Records matching `predicate`, ordered by id.
    async fn query(&self, predicate: &Predicate) -> Result<Vec<Record>, Error>;

    async fn len(&self) -> Result<usize, Error>;
}

/// In-memory [`LocalStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records ordered by id.
    pub fn snapshot(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn insert(&self, record: Record) -> Result<(), Error> {
        self.records.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn update(&self, id: &str, patch: &Map<String, Value>) -> Result<(), Error> {
        let mut records = self.records.write();
        let record = records.entry(id.to_string()).or_insert_with(|| Record::new(id));
        for (field, value) in patch {
            record.fields.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        self.records.write().remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Record>, Error> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn query(&self, predicate: &Predicate) -> Result<Vec<Record>, Error> {
        Ok(self.snapshot().into_iter().filter(|r| predicate.matches(r)).collect())
    }

    async fn len(&self) -> Result<usize, Error> {
        Ok(self.records.read().len())
    }
}
