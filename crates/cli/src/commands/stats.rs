//! `stats` command: what the replica currently holds.

use casefeed_core::{AppConfig, Error, ReplicaDb};
use serde::Serialize;

/// Record count for one replicated collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub collection: String,
    pub records: u64,
    /// Newest partition date stored, if any record carries one.
    pub latest: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsOutput {
    pub db_path: String,
    pub collections: Vec<CollectionStats>,
}

pub async fn stats_impl(config: &AppConfig) -> Result<StatsOutput, Error> {
    let db = ReplicaDb::open(&config.db_path).await?;
    summarize(&db, config.db_path.display().to_string()).await
}

async fn summarize(db: &ReplicaDb, db_path: String) -> Result<StatsOutput, Error> {
    let collections = db
        .collection_summaries()
        .await?
        .into_iter()
        .map(|(collection, records, latest)| CollectionStats { collection, records, latest })
        .collect();
    Ok(StatsOutput { db_path, collections })
}

#[cfg(test)]
mod tests {
    use super::*;
    use casefeed_core::Record;

    #[tokio::test]
    async fn test_summarize_empty_replica() {
        let db = ReplicaDb::open_in_memory().await.unwrap();
        let output = summarize(&db, ":memory:".into()).await.unwrap();
        assert!(output.collections.is_empty());
    }

    #[tokio::test]
    async fn test_summarize_counts_per_collection() {
        let db = ReplicaDb::open_in_memory().await.unwrap();
        let notice = Record::new("n1").with("notice_date", "2024-02-01");
        db.upsert_record("notices", &notice, Some("2024-02-01")).await.unwrap();

        let output = summarize(&db, ":memory:".into()).await.unwrap();
        assert_eq!(output.collections, vec![CollectionStats {
            collection: "notices".into(),
            records: 1,
            latest: Some("2024-02-01".into()),
        }]);
    }
}
