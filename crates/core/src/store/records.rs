//! Record CRUD operations on the SQLite replica.
//!
//! Rows are keyed by `(collection, id)`. The record body is stored as a JSON
//! object; the partition date is copied into its own column for ordering.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

use super::LocalStore;
use super::connection::ReplicaDb;
use crate::{CollectionSpec, Error, Predicate, Record};

impl ReplicaDb {
    /// Insert or replace a record.
    pub async fn upsert_record(
        &self, collection: &str, record: &Record, partition_date: Option<&str>,
    ) -> Result<(), Error> {
        let collection = collection.to_string();
        let id = record.id.clone();
        let body = serde_json::to_string(&record.fields)?;
        let partition_date = partition_date.map(str::to_string);
        let updated_at = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO records (collection, id, partition_date, body_json, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(collection, id) DO UPDATE SET
                        partition_date = excluded.partition_date,
                        body_json = excluded.body_json,
                        updated_at = excluded.updated_at",
                    params![collection, id, partition_date, body, updated_at],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Merge `patch` into a stored record, inserting it when absent.
    ///
    /// Read and write happen in one call on the connection thread.
    pub async fn merge_record(
        &self, collection: &str, id: &str, patch: &Map<String, Value>, date_field: &str,
    ) -> Result<(), Error> {
        let collection = collection.to_string();
        let id = id.to_string();
        let patch = patch.clone();
        let date_field = date_field.to_string();
        let updated_at = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| -> Result<(), Error> {
                let existing = conn.query_row(
                    "SELECT body_json FROM records WHERE collection = ?1 AND id = ?2",
                    params![collection, id],
                    |row| row.get::<_, String>(0),
                );

                let mut fields: Map<String, Value> = match existing {
                    Ok(body) => serde_json::from_str(&body)?,
                    Err(rusqlite::Error::QueryReturnedNoRows) => Map::new(),
                    Err(e) => return Err(e.into()),
                };
                for (field, value) in patch {
                    fields.insert(field, value);
                }

                let partition_date = fields.get(&date_field).and_then(Value::as_str).map(str::to_string);
                let body = serde_json::to_string(&fields)?;
                conn.execute(
                    "INSERT INTO records (collection, id, partition_date, body_json, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(collection, id) DO UPDATE SET
                        partition_date = excluded.partition_date,
                        body_json = excluded.body_json,
                        updated_at = excluded.updated_at",
                    params![collection, id, partition_date, body, updated_at],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Delete a record. Returns whether a row was removed.
    pub async fn delete_record(&self, collection: &str, id: &str) -> Result<bool, Error> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let count =
                    conn.execute("DELETE FROM records WHERE collection = ?1 AND id = ?2", params![collection, id])?;
                Ok(count > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Get a record by id.
    ///
    /// Returns None if the id doesn't exist in the collection.
    pub async fn get_record(&self, collection: &str, id: &str) -> Result<Option<Record>, Error> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.conn
            .call(move |conn| -> Result<Option<Record>, Error> {
                let result = conn.query_row(
                    "SELECT body_json FROM records WHERE collection = ?1 AND id = ?2",
                    params![collection, id],
                    |row| row.get::<_, String>(0),
                );

                match result {
                    Ok(body) => Ok(Some(Record { id, fields: serde_json::from_str(&body)? })),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// All records of a collection ordered by id.
    pub async fn list_records(&self, collection: &str) -> Result<Vec<Record>, Error> {
        let collection = collection.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<Record>, Error> {
                let mut stmt = conn.prepare("SELECT id, body_json FROM records WHERE collection = ?1 ORDER BY id")?;
                let rows = stmt
                    .query_map(params![collection], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter()
                    .map(|(id, body)| -> Result<Record, Error> { Ok(Record { id, fields: serde_json::from_str(&body)? }) })
                    .collect()
            })
            .await
            .map_err(Error::from)
    }

    pub async fn count_records(&self, collection: &str) -> Result<u64, Error> {
        let collection = collection.to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM records WHERE collection = ?1", params![collection], |row| {
                        row.get(0)
                    })?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Row counts and newest partition date per collection.
    pub async fn collection_summaries(&self) -> Result<Vec<(String, u64, Option<String>)>, Error> {
        self.conn
            .call(move |conn| -> Result<Vec<(String, u64, Option<String>)>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT collection, COUNT(*), MAX(partition_date) FROM records
                    GROUP BY collection ORDER BY collection",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64, row.get::<_, Option<String>>(2)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(Error::from)
    }
}

/// One collection of a [`ReplicaDb`], usable as a [`LocalStore`].
#[derive(Clone, Debug)]
pub struct ReplicaCollection {
    db: ReplicaDb,
    collection: String,
    date_field: String,
}

impl ReplicaCollection {
    pub fn new(db: ReplicaDb, spec: &CollectionSpec) -> Self {
        Self { db, collection: spec.resource.clone(), date_field: spec.date_field.clone() }
    }

    pub fn name(&self) -> &str {
        &self.collection
    }
}

#[async_trait]
impl LocalStore for ReplicaCollection {
    async fn insert(&self, record: Record) -> Result<(), Error> {
        let partition_date = record.text(&self.date_field).map(str::to_string);
        self.db.upsert_record(&self.collection, &record, partition_date.as_deref()).await
    }

    async fn update(&self, id: &str, patch: &Map<String, Value>) -> Result<(), Error> {
        self.db.merge_record(&self.collection, id, patch, &self.date_field).await
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        self.db.delete_record(&self.collection, id).await.map(|_| ())
    }

    async fn get(&self, id: &str) -> Result<Option<Record>, Error> {
        self.db.get_record(&self.collection, id).await
    }

    async fn query(&self, predicate: &Predicate) -> Result<Vec<Record>, Error> {
        let records = self.db.list_records(&self.collection).await?;
        Ok(records.into_iter().filter(|r| predicate.matches(r)).collect())
    }

    async fn len(&self) -> Result<usize, Error> {
        self.db.count_records(&self.collection).await.map(|n| n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SearchParams;
    use serde_json::json;

    fn make_case(id: &str, name: &str, date: &str) -> Record {
        Record::new(id)
            .with("offender_name", name)
            .with("offence_action_date", date)
            .with("offence_fine", 1000)
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let db = ReplicaDb::open_in_memory().await.unwrap();
        let cases = db.collection(&CollectionSpec::cases());

        cases.insert(make_case("c1", "Acme Ltd", "2024-03-01")).await.unwrap();
        cases.insert(make_case("c1", "Acme Limited", "2024-03-01")).await.unwrap();

        let retrieved = cases.get("c1").await.unwrap().unwrap();
        assert_eq!(retrieved.text("offender_name"), Some("Acme Limited"));
        assert_eq!(retrieved.get("offence_fine"), Some(&json!(1000)));
        assert_eq!(cases.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let db = ReplicaDb::open_in_memory().await.unwrap();
        let cases = db.collection(&CollectionSpec::cases());
        assert!(cases.get("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_merges_patch() {
        let db = ReplicaDb::open_in_memory().await.unwrap();
        let cases = db.collection(&CollectionSpec::cases());
        cases.insert(make_case("c1", "Acme Ltd", "2024-03-01")).await.unwrap();

        let patch = Record::new("c1").with("offence_fine", 2500).fields;
        cases.update("c1", &patch).await.unwrap();
        cases.update("c2", &make_case("c2", "Beta plc", "2020-01-01").fields).await.unwrap();

        let c1 = cases.get("c1").await.unwrap().unwrap();
        assert_eq!(c1.get("offence_fine"), Some(&json!(2500)));
        assert_eq!(c1.text("offender_name"), Some("Acme Ltd"));
        assert!(cases.get("c2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let db = ReplicaDb::open_in_memory().await.unwrap();
        let cases = db.collection(&CollectionSpec::cases());
        let notices = db.collection(&CollectionSpec::notices());

        cases.insert(make_case("x", "Acme", "2024-01-01")).await.unwrap();
        notices.insert(Record::new("x").with("notice_date", "2023-05-05")).await.unwrap();
        notices.delete("x").await.unwrap();

        assert_eq!(cases.len().await.unwrap(), 1);
        assert_eq!(notices.len().await.unwrap(), 0);

        let summaries = db.collection_summaries().await.unwrap();
        assert_eq!(summaries, vec![("cases".to_string(), 1, Some("2024-01-01".to_string()))]);
    }

    #[tokio::test]
    async fn test_query_filters_by_predicate() {
        let db = ReplicaDb::open_in_memory().await.unwrap();
        let spec = CollectionSpec::cases();
        let cases = db.collection(&spec);
        cases.insert(make_case("c1", "Acme Ltd", "2024-03-01")).await.unwrap();
        cases.insert(make_case("c2", "Beta plc", "2024-03-02")).await.unwrap();
        cases.insert(make_case("c3", "ACME North", "2019-01-01")).await.unwrap();

        let params =
            SearchParams { search_term: Some("acme".into()), date_from: Some("2020-01-01".into()), ..Default::default() };
        let hits = cases.query(&Predicate::for_search(&params, &spec)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c1");
    }
}
