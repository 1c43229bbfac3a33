//! One application session's worth of sync state.

use std::sync::Arc;

use casefeed_core::{AppConfig, CollectionSpec, Error, LocalStore, Record, ReplicaDb, SearchParams, ShapeSource};

use crate::on_demand::OnDemandCacheController;
use crate::progress::ViewNotifier;
use crate::progressive::ProgressiveSyncController;

/// A collection paired with the local store it replicates into.
#[derive(Clone)]
pub struct CollectionBinding {
    pub spec: CollectionSpec,
    pub store: Arc<dyn LocalStore>,
}

impl CollectionBinding {
    pub fn new(spec: CollectionSpec, store: Arc<dyn LocalStore>) -> Self {
        Self { spec, store }
    }
}

/// Owns both controllers and the shape cache for the lifetime of a session.
///
/// Dropping the session closes every subscription it opened.
pub struct SyncSession {
    config: AppConfig,
    progressive: ProgressiveSyncController,
    on_demand: OnDemandCacheController,
}

impl SyncSession {
    pub fn new(
        config: AppConfig, source: Arc<dyn ShapeSource>, notifier: Arc<dyn ViewNotifier>,
        progressive: CollectionBinding, on_demand: CollectionBinding,
    ) -> Self {
        let progressive = ProgressiveSyncController::new(
            progressive.spec,
            Arc::clone(&source),
            progressive.store,
            Arc::clone(&notifier),
            &config,
        );
        let on_demand = OnDemandCacheController::new(on_demand.spec, source, on_demand.store, notifier, &config);
        Self { config, progressive, on_demand }
    }

    /// Session replicating notices progressively and cases on demand into `db`.
    pub fn with_replica(
        config: AppConfig, source: Arc<dyn ShapeSource>, notifier: Arc<dyn ViewNotifier>, db: &ReplicaDb,
    ) -> Self {
        let notices = CollectionSpec::notices();
        let cases = CollectionSpec::cases();
        let progressive = CollectionBinding::new(notices.clone(), Arc::new(db.collection(&notices)));
        let on_demand = CollectionBinding::new(cases.clone(), Arc::new(db.collection(&cases)));
        Self::new(config, source, notifier, progressive, on_demand)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn progressive(&self) -> &ProgressiveSyncController {
        &self.progressive
    }

    pub fn on_demand(&self) -> &OnDemandCacheController {
        &self.on_demand
    }

    /// Start both controllers.
    ///
    /// Both are attempted even if the first fails; the first error is returned.
    pub async fn start(&self) -> Result<(), Error> {
        let progressive = self.progressive.start().await;
        let on_demand = self.on_demand.init().await;
        tracing::info!(
            progressive = %self.progressive.spec().resource,
            on_demand = %self.on_demand.spec().resource,
            ok = progressive.is_ok() && on_demand.is_ok(),
            "sync session started"
        );
        progressive.and(on_demand)
    }

    pub async fn search(&self, params: &SearchParams) -> Result<Vec<Record>, Error> {
        self.on_demand.search(params).await
    }

    /// Stop both controllers. Safe to call repeatedly.
    pub fn stop(&self) {
        self.progressive.stop();
        self.on_demand.disconnect();
        tracing::info!("sync session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeed;
    use crate::progress::{NoopNotifier, SyncPhase};
    use casefeed_core::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;

    fn feed() -> MemoryFeed {
        let feed = MemoryFeed::new();
        let today = Utc::now().date_naive().to_string();
        feed.seed("notices", vec![Record::new("n1").with("notice_date", today.as_str())]);
        feed.seed(
            "cases",
            vec![Record::new("c1").with("offender_name", "Acme Ltd").with("offence_action_date", today.as_str())],
        );
        feed
    }

    #[tokio::test]
    async fn test_session_starts_and_stops_everything() {
        let feed = feed();
        let session = SyncSession::new(
            AppConfig::default(),
            Arc::new(feed.clone()),
            Arc::new(NoopNotifier),
            CollectionBinding::new(CollectionSpec::notices(), Arc::new(MemoryStore::new())),
            CollectionBinding::new(CollectionSpec::cases(), Arc::new(MemoryStore::new())),
        );

        session.start().await.unwrap();
        assert_eq!(feed.active_subscriptions(), 3);

        let found = session.search(&SearchParams::term("acme")).await.unwrap();
        assert_eq!(found.len(), 1);

        session.stop();
        assert_eq!(feed.active_subscriptions(), 0);
        assert_eq!(session.progressive().snapshot().phase, SyncPhase::Idle);
        assert_eq!(session.on_demand().snapshot().phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_session_over_sqlite_replica() {
        let feed = feed();
        let db = ReplicaDb::open_in_memory().await.unwrap();
        let source = Arc::new(feed.clone());
        let session = SyncSession::with_replica(AppConfig::default(), source, Arc::new(NoopNotifier), &db);
        let mut progress = session.progressive().progress();

        session.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), progress.wait_for(|p| p.recent_cases_loaded))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(db.count_records("notices").await.unwrap(), 1);
        session.stop();
    }

    #[tokio::test]
    async fn test_start_reports_first_error_but_tries_both() {
        let feed = feed();
        feed.fail_next_open("refused");
        let session = SyncSession::new(
            AppConfig::default(),
            Arc::new(feed.clone()),
            Arc::new(NoopNotifier),
            CollectionBinding::new(CollectionSpec::notices(), Arc::new(MemoryStore::new())),
            CollectionBinding::new(CollectionSpec::cases(), Arc::new(MemoryStore::new())),
        );

        assert!(session.start().await.is_err());
        // notices failed, cases changes + baseline opened
        assert_eq!(feed.active_subscriptions(), 2);
        session.stop();
    }
}
