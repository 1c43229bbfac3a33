//! `replay` command: run one sync session over exported feeds.
//!
//! Both exports are served from an in-process feed, so the session sees the
//! same subscription traffic it would against a live source: notices sync
//! recent-first then historical, cases get a baseline plus an optional search.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use casefeed_client::{BatcherStats, MemoryFeed, RefreshReason, SyncPhase, SyncProgress, SyncSession, ViewNotifier};
use casefeed_core::{AppConfig, CacheStats, Error, ReplicaDb, SearchParams};
use serde::Serialize;
use tokio::sync::watch;

use crate::cli::ReplayArgs;

/// Stands in for a view: logs every refresh request.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl ViewNotifier for LogNotifier {
    fn refresh(&self, reason: RefreshReason) {
        tracing::info!(?reason, "view refresh requested");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadedCounts {
    pub notices: usize,
    pub cases: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutput {
    pub description: String,
    pub count: usize,
    pub ids: Vec<String>,
}

/// Batcher counters per collection.
#[derive(Debug, Clone, Serialize)]
pub struct BatcherTotals {
    pub notices: BatcherStats,
    pub cases: BatcherStats,
}

/// Output from the replay command.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutput {
    pub loaded: LoadedCounts,
    pub progressive: SyncProgress,
    pub on_demand: SyncProgress,
    pub cache: CacheStats,
    pub batches: BatcherTotals,
    pub search: Option<SearchOutput>,
}

pub async fn replay_impl(config: AppConfig, args: ReplayArgs) -> Result<ReplayOutput, Error> {
    let db = ReplicaDb::open(&config.db_path).await?;
    replay_into(config, &db, args).await
}

async fn replay_into(config: AppConfig, db: &ReplicaDb, args: ReplayArgs) -> Result<ReplayOutput, Error> {
    let feed = MemoryFeed::new();
    let loaded = LoadedCounts {
        notices: load_export(&feed, "notices", &args.notices)?,
        cases: load_export(&feed, "cases", &args.cases)?,
    };
    let wait = Duration::from_secs(args.wait_secs);

    let session = SyncSession::with_replica(config, Arc::new(feed), Arc::new(LogNotifier), db);
    session.start().await?;

    wait_for(session.progressive().progress(), wait, "notices", |p| p.phase == SyncPhase::Complete).await;
    wait_for(session.on_demand().progress(), wait, "cases", |p| p.baseline_ready_time.is_some()).await;

    let search = if args.has_search() {
        let params = SearchParams {
            search_term: args.search.clone(),
            record_type: args.record_type.clone(),
            agency_id: args.agency.clone(),
            date_from: args.date_from.clone(),
            date_to: args.date_to.clone(),
        };
        let records = session.search(&params).await?;
        Some(SearchOutput {
            description: params.description(),
            count: records.len(),
            ids: records.into_iter().map(|r| r.id).collect(),
        })
    } else {
        None
    };

    session.progressive().batcher().flush_all().await;
    session.on_demand().batcher().flush_all().await;

    let output = ReplayOutput {
        loaded,
        progressive: session.progressive().snapshot(),
        on_demand: session.on_demand().snapshot(),
        cache: session.on_demand().cache_stats(),
        batches: BatcherTotals {
            notices: session.progressive().batcher().stats(),
            cases: session.on_demand().batcher().stats(),
        },
        search,
    };
    session.stop();
    Ok(output)
}

fn load_export(feed: &MemoryFeed, resource: &str, path: &Path) -> Result<usize, Error> {
    let file = File::open(path).map_err(|e| Error::InvalidInput(format!("{}: {e}", path.display())))?;
    let count = feed.load_ndjson(resource, BufReader::new(file))?;
    tracing::info!(resource, count, path = %path.display(), "loaded export");
    Ok(count)
}

/// Wait up to `limit` for `done`; an empty partition never completes, so a timeout only warns.
async fn wait_for(
    mut progress: watch::Receiver<SyncProgress>, limit: Duration, label: &str, done: impl FnMut(&SyncProgress) -> bool,
) -> bool {
    match tokio::time::timeout(limit, progress.wait_for(done)).await {
        Ok(Ok(_)) => true,
        Ok(Err(_)) => false,
        Err(_) => {
            tracing::warn!(collection = label, waited_secs = limit.as_secs(), "sync did not finish in time");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_export(name: &str, lines: &[String]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("casefeed-{}-{name}.ndjson", std::process::id()));
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    fn args(notices: PathBuf, cases: PathBuf, search: Option<&str>) -> ReplayArgs {
        ReplayArgs {
            notices,
            cases,
            search: search.map(str::to_string),
            record_type: None,
            agency: None,
            date_from: None,
            date_to: None,
            wait_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_replay_syncs_both_collections_and_searches() {
        let today = chrono::Utc::now().date_naive().to_string();
        let notices = write_export("notices", &[
            format!(r#"{{"id": "n1", "notice_date": "{today}", "offender_name": "Acme Ltd"}}"#),
            r#"{"id": "n2", "notice_date": "2002-07-01", "offender_name": "Beta Farms"}"#.to_string(),
        ]);
        let cases = write_export("cases", &[
            r#"{"id": "c1", "offence_action_date": "2024-03-01", "offender_name": "Acme Ltd", "offence_fine": "2,000"}"#
                .to_string(),
            r#"{"id": "c2", "offence_action_date": "2024-04-01", "offender_name": "Beta Farms"}"#.to_string(),
        ]);

        let db = ReplicaDb::open_in_memory().await.unwrap();
        let config = AppConfig { historical_delay_ms: 10, ..Default::default() };
        let output = replay_into(config, &db, args(notices.clone(), cases.clone(), Some("acme"))).await.unwrap();

        assert_eq!(output.loaded.notices, 2);
        assert_eq!(output.progressive.phase, SyncPhase::Complete);
        assert_eq!(output.progressive.total_synced(), 2);
        assert_eq!(output.batches.notices.applied, 2);
        assert_eq!(output.batches.notices.dropped, 0);
        assert_eq!(output.batches.cases.dropped, 0);

        let search = output.search.unwrap();
        assert_eq!(search.ids, vec!["c1"]);
        assert_eq!(search.description, "Search: \"acme\"");
        assert_eq!(output.cache.size, 1);

        assert_eq!(db.count_records("notices").await.unwrap(), 2);
        assert_eq!(db.count_records("cases").await.unwrap(), 2);

        std::fs::remove_file(notices).ok();
        std::fs::remove_file(cases).ok();
    }

    #[tokio::test]
    async fn test_missing_export_is_invalid_input() {
        let db = ReplicaDb::open_in_memory().await.unwrap();
        let missing = PathBuf::from("/nonexistent/casefeed.ndjson");
        let err = replay_into(AppConfig::default(), &db, args(missing.clone(), missing, None)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }
}
