//! On-demand replication of a collection too large to copy whole.
//!
//! Three kinds of subscription feed the local store:
//! - a changes-only stream applied message by message
//! - a full baseline stream of which only the newest `baseline_limit` records are kept
//! - one stream per distinct search, held open in a [`ShapeCacheManager`]
//!
//! The baseline cannot be limited remotely, so every baseline batch is merged
//! into an in-memory window, sorted newest first and truncated before anything
//! is written.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use casefeed_core::{
    AppConfig, BatchStream, CacheStats, ChangeBatch, ChangeMessage, CollectionSpec, Error, LocalStore, Operation,
    Predicate, Record, SearchParams, ShapeCacheManager, ShapeRequest, ShapeSource, coerce_numeric,
};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::batcher::{MessageBatcher, apply_change};
use crate::progress::{ProgressError, RefreshReason, SyncPhase, SyncProgress, ViewNotifier};
use crate::stream::{ActiveStream, StreamGuard};

/// Newest-first window over the baseline stream.
#[derive(Debug)]
struct BaselineWindow {
    limit: usize,
    date_field: String,
    records: HashMap<String, Record>,
}

impl BaselineWindow {
    fn new(limit: usize, date_field: &str) -> Self {
        Self { limit: limit.max(1), date_field: date_field.to_string(), records: HashMap::new() }
    }

    /// Fold one message into the window. Updates for ids outside it are ignored.
    fn apply(&mut self, msg: &ChangeMessage, numeric_fields: &[String]) -> bool {
        let ChangeMessage::Change { operation, value } = msg else {
            return false;
        };
        match operation {
            Operation::Insert => {
                let mut record = value.clone();
                coerce_numeric(&mut record, numeric_fields, true);
                self.records.insert(record.id.clone(), record);
                true
            }
            Operation::Update => match self.records.get_mut(&value.id) {
                Some(existing) => {
                    let mut patch = value.clone();
                    coerce_numeric(&mut patch, numeric_fields, false);
                    existing.merge(&patch);
                    true
                }
                None => false,
            },
            Operation::Delete => self.records.remove(&value.id).is_some(),
        }
    }

    /// Drop everything past the limit.
    fn truncate(&mut self) {
        if self.records.len() <= self.limit {
            return;
        }
        let evicted: Vec<String> = self.sorted().into_iter().skip(self.limit).map(|r| r.id).collect();
        for id in evicted {
            self.records.remove(&id);
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn clear(&mut self) {
        self.records.clear();
    }

    /// Newest first; undated records last; ties by id.
    fn sorted(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.records.values().cloned().collect();
        records.sort_by(|a, b| {
            match (a.text(&self.date_field), b.text(&self.date_field)) {
                (Some(x), Some(y)) => y.cmp(x),
                (Some(_), None) => CmpOrdering::Less,
                (None, Some(_)) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            }
            .then_with(|| a.id.cmp(&b.id))
        });
        records
    }
}

#[derive(Default)]
struct Streams {
    changes: Option<ActiveStream>,
    baseline: Option<ActiveStream>,
    /// Search subscriptions still waiting for their first batch.
    pending: HashMap<u64, ActiveStream>,
    next_search: u64,
}

/// A search registered in `Streams::pending`; dropping it closes the stream.
struct PendingSearch<'a> {
    inner: &'a Inner,
    id: u64,
}

impl PendingSearch<'_> {
    /// Take the stream back, or `None` if `disconnect()` already closed it.
    fn finish(self) -> Option<ActiveStream> {
        self.inner.streams.lock().pending.remove(&self.id)
    }
}

impl Drop for PendingSearch<'_> {
    fn drop(&mut self) {
        let stream = self.inner.streams.lock().pending.remove(&self.id);
        if let Some(stream) = stream {
            stream.shutdown();
        }
    }
}

struct Inner {
    spec: CollectionSpec,
    source: Arc<dyn ShapeSource>,
    batcher: MessageBatcher,
    notifier: Arc<dyn ViewNotifier>,
    search_timeout: Duration,
    cache: Mutex<ShapeCacheManager<ActiveStream>>,
    baseline: Mutex<BaselineWindow>,
    streams: Mutex<Streams>,
    progress: watch::Sender<SyncProgress>,
    results: watch::Sender<Vec<Record>>,
    showing_baseline: AtomicBool,
    generation: AtomicU64,
}

/// Baseline, live changes and cached ad-hoc searches over one collection.
pub struct OnDemandCacheController {
    inner: Arc<Inner>,
}

type FirstBatch = oneshot::Sender<Result<Vec<Record>, Error>>;

impl OnDemandCacheController {
    pub fn new(
        spec: CollectionSpec, source: Arc<dyn ShapeSource>, store: Arc<dyn LocalStore>,
        notifier: Arc<dyn ViewNotifier>, config: &AppConfig,
    ) -> Self {
        let batcher = MessageBatcher::new(store, spec.numeric_fields.clone(), config.batcher());
        let (progress, _) = watch::channel(SyncProgress::default());
        let (results, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                baseline: Mutex::new(BaselineWindow::new(config.baseline_limit, &spec.date_field)),
                spec,
                source,
                batcher,
                notifier,
                search_timeout: config.search_timeout(),
                cache: Mutex::new(ShapeCacheManager::new(config.max_shapes)),
                streams: Mutex::new(Streams::default()),
                progress,
                results,
                showing_baseline: AtomicBool::new(true),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn spec(&self) -> &CollectionSpec {
        &self.inner.spec
    }

    pub fn batcher(&self) -> &MessageBatcher {
        &self.inner.batcher
    }

    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.inner.progress.subscribe()
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.inner.progress.borrow().clone()
    }

    /// Records the view should currently render: the baseline or the last search.
    pub fn results(&self) -> watch::Receiver<Vec<Record>> {
        self.inner.results.subscribe()
    }

    /// Retained baseline records, newest first.
    pub fn baseline(&self) -> Vec<Record> {
        self.inner.baseline.lock().sorted()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.lock().get_stats()
    }

    /// Close every cached search subscription.
    pub fn clear_cache(&self) {
        self.inner.cache.lock().clear();
        self.inner.batcher.prune();
        self.inner.progress.send_modify(|p| p.cached_shapes = 0);
    }

    /// Open the live changes stream and the baseline.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if either subscription cannot be opened.
    pub async fn init(&self) -> Result<(), Error> {
        self.start_changes_only_stream().await?;
        self.sync_baseline().await
    }

    /// Subscribe to future mutations only and apply each one directly.
    pub async fn start_changes_only_stream(&self) -> Result<(), Error> {
        if self.inner.streams.lock().changes.is_some() {
            return Ok(());
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let subscription = self
            .inner
            .source
            .open(ShapeRequest::changes_only(&self.inner.spec.resource))
            .await
            .inspect_err(|e| self.inner.record_error("changes", e))?;

        let (handle, batches) = subscription.split();
        let name = format!("{}:changes", self.inner.spec.resource);
        let guard = StreamGuard::new();
        let reader = tokio::spawn(Inner::read_changes(Arc::clone(&self.inner), guard.clone(), batches));
        self.inner.keep_stream(generation, ActiveStream::new(name, handle, guard, reader), |s| &mut s.changes);
        Ok(())
    }

    /// Subscribe to the whole collection, keeping the newest records only.
    pub async fn sync_baseline(&self) -> Result<(), Error> {
        if self.inner.streams.lock().baseline.is_some() {
            return Ok(());
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let subscription = self
            .inner
            .source
            .open(ShapeRequest::full(&self.inner.spec.resource, None))
            .await
            .inspect_err(|e| self.inner.record_error("baseline", e))?;

        let (handle, batches) = subscription.split();
        let name = format!("{}:baseline", self.inner.spec.resource);
        let guard = StreamGuard::new();
        let task = Inner::read_baseline(Arc::clone(&self.inner), name.clone(), guard.clone(), batches, generation);
        let reader = tokio::spawn(task);
        self.inner.keep_stream(generation, ActiveStream::new(name, handle, guard, reader), |s| &mut s.baseline);
        Ok(())
    }

    /// Materialize the records matching `params`.
    ///
    /// A repeated search is served from the local store without a new
    /// subscription. A search with no filters returns the baseline. Otherwise a
    /// subscription is opened and the first batch of data answers the call; the
    /// subscription then stays open as a cached shape.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidInput` for malformed date filters
    /// - `Error::Connection` if the subscription fails before delivering data
    /// - `Error::Timeout` if no data arrives within the search timeout
    ///
    /// No cache entry is created on failure.
    pub async fn search(&self, params: &SearchParams) -> Result<Vec<Record>, Error> {
        params.validate()?;
        let key = params.cache_key();
        let description = params.description();
        let predicate = Predicate::for_search(params, &self.inner.spec);

        let hit = self.inner.cache.lock().get(&key).is_some();
        if hit {
            let records = self.inner.batcher.store().query(&predicate).await?;
            tracing::debug!(key, count = records.len(), "serving search from cached shape");
            self.inner.show(records.clone(), &description, false);
            return Ok(records);
        }

        if predicate.is_empty() {
            let records = self.baseline();
            self.inner.show(records.clone(), &description, true);
            return Ok(records);
        }

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let resume_phase = self.inner.progress.borrow().phase;
        self.inner.progress.send_modify(|p| {
            p.phase = SyncPhase::Searching;
            p.last_search = Some(description.clone());
        });

        let request = ShapeRequest::full(&self.inner.spec.resource, Some(predicate));
        let name = format!("{}:search:{}", self.inner.spec.resource, request.fingerprint());
        tracing::info!(key, predicate = request.where_clause().unwrap_or_default(), "cache miss, opening search");

        let subscription = match self.inner.source.open(request).await {
            Ok(subscription) => subscription,
            Err(e) => return Err(self.inner.search_failed(e, resume_phase)),
        };

        let (handle, batches) = subscription.split();
        let guard = StreamGuard::new();
        let (first_tx, first_rx) = oneshot::channel();
        let reader =
            tokio::spawn(Inner::read_search(Arc::clone(&self.inner), name.clone(), guard.clone(), batches, first_tx));
        let Some(pending) = self.inner.track_search(generation, ActiveStream::new(name, handle, guard, reader)) else {
            return Err(cancelled(&description));
        };

        let outcome = match tokio::time::timeout(self.inner.search_timeout, first_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connection(format!("search subscription for {description} ended without data"))),
            Err(_) => Err(Error::Timeout(format!(
                "no data for {description} within {}ms",
                self.inner.search_timeout.as_millis()
            ))),
        };

        let Some(active) = pending.finish() else {
            return Err(cancelled(&description));
        };
        let records = match outcome {
            Ok(records) => records,
            Err(e) => {
                active.shutdown();
                return Err(self.inner.search_failed(e, resume_phase));
            }
        };

        let cached_shapes = {
            let mut cache = self.inner.cache.lock();
            // disconnect() bumps the generation before clearing the cache
            if !self.inner.is_current(generation) {
                drop(cache);
                active.shutdown();
                return Err(cancelled(&description));
            }
            cache.add(&key, &description, active, records.len());
            cache.len()
        };
        self.inner.batcher.prune();

        self.inner.progress.send_modify(|p| {
            p.phase = SyncPhase::Complete;
            p.cached_shapes = cached_shapes;
            p.error = None;
        });
        self.inner.show(records.clone(), &description, false);
        tracing::info!(key, count = records.len(), cached_shapes, "search materialized");
        Ok(records)
    }

    /// Close every subscription, drop cached shapes and return to `Idle`.
    pub fn disconnect(&self) {
        self.inner.shutdown();
        self.inner.progress.send_modify(|p| {
            p.phase = SyncPhase::Idle;
            p.cached_shapes = 0;
            p.baseline_count = 0;
        });
    }
}

impl Drop for OnDemandCacheController {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn shutdown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let (changes, baseline, pending) = {
            let mut streams = self.streams.lock();
            let pending: Vec<ActiveStream> = streams.pending.drain().map(|(_, stream)| stream).collect();
            (streams.changes.take(), streams.baseline.take(), pending)
        };
        for stream in [changes, baseline].into_iter().flatten().chain(pending) {
            stream.shutdown();
        }
        self.cache.lock().clear();
        self.batcher.cancel_all();
        self.baseline.lock().clear();
    }

    fn keep_stream(
        &self, generation: u64, stream: ActiveStream, slot: impl FnOnce(&mut Streams) -> &mut Option<ActiveStream>,
    ) {
        let mut streams = self.streams.lock();
        if !self.is_current(generation) {
            drop(streams);
            stream.shutdown();
            return;
        }
        if let Some(previous) = slot(&mut streams).replace(stream) {
            previous.shutdown();
        }
    }

    fn track_search(&self, generation: u64, stream: ActiveStream) -> Option<PendingSearch<'_>> {
        let mut streams = self.streams.lock();
        if !self.is_current(generation) {
            drop(streams);
            stream.shutdown();
            return None;
        }
        let id = streams.next_search;
        streams.next_search += 1;
        streams.pending.insert(id, stream);
        Some(PendingSearch { inner: self, id })
    }

    fn record_error(&self, stream: &str, err: &Error) {
        tracing::error!(resource = %self.spec.resource, stream, error = %err, "subscription failed");
        self.progress.send_modify(|p| p.error = Some(ProgressError::from(err)));
    }

    fn search_failed(&self, err: Error, resume_phase: SyncPhase) -> Error {
        tracing::warn!(resource = %self.spec.resource, error = %err, "search failed");
        self.progress.send_modify(|p| {
            p.phase = resume_phase;
            p.error = Some(ProgressError::from(&err));
        });
        err
    }

    /// Publish what the view should render.
    fn show(&self, records: Vec<Record>, description: &str, baseline: bool) {
        self.showing_baseline.store(baseline, Ordering::SeqCst);
        let count = records.len();
        self.results.send_replace(records);
        self.progress.send_modify(|p| {
            p.search_result_count = count;
            p.last_search = Some(description.to_string());
        });
        self.notifier.refresh(RefreshReason::SearchResults);
    }

    fn refresh_baseline_view(&self) {
        let (records, count) = {
            let window = self.baseline.lock();
            (window.sorted(), window.len())
        };
        self.progress.send_modify(|p| p.baseline_count = count);
        if self.showing_baseline.load(Ordering::SeqCst) {
            self.results.send_replace(records);
        }
    }

    async fn read_changes(inner: Arc<Inner>, guard: StreamGuard, mut batches: BatchStream) {
        let store = inner.batcher.store().clone();
        let numeric_fields = inner.spec.numeric_fields.clone();

        while let Some(next) = batches.next().await {
            let batch = match next {
                Ok(batch) => batch,
                Err(e) => {
                    inner.record_error("changes", &e);
                    continue;
                }
            };

            let mut baseline_changed = false;
            for msg in batch {
                if !guard.is_active() {
                    return;
                }
                if msg.is_control() {
                    continue;
                }
                {
                    let mut window = inner.baseline.lock();
                    if window.apply(&msg, &numeric_fields) {
                        window.truncate();
                        baseline_changed = true;
                    }
                }
                if let Err(e) = apply_change(store.as_ref(), &numeric_fields, msg).await {
                    tracing::warn!(resource = %inner.spec.resource, error = %e, "dropping live change");
                }
            }
            if baseline_changed {
                inner.refresh_baseline_view();
            }
        }
    }

    async fn read_baseline(
        inner: Arc<Inner>, name: String, guard: StreamGuard, mut batches: BatchStream, generation: u64,
    ) {
        let mut ready = false;

        while let Some(next) = batches.next().await {
            if !guard.is_active() {
                break;
            }
            let batch = match next {
                Ok(batch) => batch,
                Err(e) => {
                    inner.record_error("baseline", &e);
                    continue;
                }
            };

            let retained = inner.fold_into_baseline(batch);
            if retained.is_empty() {
                continue;
            }
            inner.batcher.push(&name, &guard, retained).await;

            if !ready {
                ready = true;
                inner.batcher.flush(&name).await;
                if !guard.is_active() || !inner.is_current(generation) {
                    break;
                }
                inner.progress.send_modify(|p| {
                    if p.phase == SyncPhase::Idle {
                        p.phase = SyncPhase::BaselineReady;
                    }
                    p.baseline_ready_time = Some(Utc::now());
                });
                inner.notifier.refresh(RefreshReason::BaselineReady);
            }
            inner.refresh_baseline_view();
        }
    }

    /// Merge a baseline batch into the window and keep only messages that still matter.
    fn fold_into_baseline(&self, batch: ChangeBatch) -> ChangeBatch {
        let mut window = self.baseline.lock();
        for msg in &batch {
            window.apply(msg, &self.spec.numeric_fields);
        }
        window.truncate();

        batch
            .into_iter()
            .filter(|msg| match msg {
                ChangeMessage::Change { operation: Operation::Delete, .. } => true,
                ChangeMessage::Change { value, .. } => window.contains(&value.id),
                ChangeMessage::Control { .. } => false,
            })
            .collect()
    }

    async fn read_search(
        inner: Arc<Inner>, name: String, guard: StreamGuard, mut batches: BatchStream, first: FirstBatch,
    ) {
        let mut first = Some(first);

        while let Some(next) = batches.next().await {
            if !guard.is_active() {
                break;
            }
            match next {
                Err(e) => {
                    tracing::warn!(stream = %name, error = %e, "search stream error");
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
                Ok(batch) if first.is_some() => {
                    let records = collect_records(batch, &inner.spec.numeric_fields);
                    if records.is_empty() {
                        continue;
                    }
                    let store = inner.batcher.store();
                    for record in &records {
                        if !guard.is_active() {
                            return;
                        }
                        if let Err(e) = store.insert(record.clone()).await {
                            tracing::warn!(stream = %name, id = %record.id, error = %e, "failed to store result");
                        }
                    }
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(records));
                    }
                }
                Ok(batch) => inner.batcher.push(&name, &guard, batch).await,
            }
        }
    }
}

fn cancelled(description: &str) -> Error {
    Error::Connection(format!("search for {description} cancelled by disconnect"))
}

/// Records carried by a batch, deduplicated by id with the last value winning.
fn collect_records(batch: ChangeBatch, numeric_fields: &[String]) -> Vec<Record> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, Record> = HashMap::new();

    for msg in batch {
        let ChangeMessage::Change { operation, mut value } = msg else {
            continue;
        };
        if operation == Operation::Delete {
            continue;
        }
        coerce_numeric(&mut value, numeric_fields, true);
        match by_id.get_mut(&value.id) {
            Some(existing) => existing.merge(&value),
            None => {
                order.push(value.id.clone());
                by_id.insert(value.id.clone(), value);
            }
        }
    }

    order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeed;
    use crate::progress::NoopNotifier;
    use casefeed_core::MemoryStore;
    use serde_json::json;

    fn case(id: &str, name: &str, date: &str) -> Record {
        Record::new(id).with("offender_name", name).with("offence_action_date", date).with("offence_fine", "1,500")
    }

    fn seeded_feed() -> MemoryFeed {
        let feed = MemoryFeed::new();
        feed.seed(
            "cases",
            vec![
                case("c1", "Acme Ltd", "2024-05-01"),
                case("c2", "Beta Farms", "2024-06-01"),
                case("c3", "ACME North", "2023-01-15"),
            ],
        );
        feed
    }

    fn controller(feed: &MemoryFeed, store: Arc<MemoryStore>, config: AppConfig) -> OnDemandCacheController {
        let source = Arc::new(feed.clone());
        OnDemandCacheController::new(CollectionSpec::cases(), source, store, Arc::new(NoopNotifier), &config)
    }

    fn test_config() -> AppConfig {
        AppConfig { search_timeout_ms: 1_000, debounce_ms: 5, ..Default::default() }
    }

    #[tokio::test]
    async fn test_search_miss_opens_shape_and_caches_it() {
        let feed = seeded_feed();
        let store = Arc::new(MemoryStore::new());
        let controller = controller(&feed, store.clone(), test_config());

        let records = controller.search(&SearchParams::term("acme")).await.unwrap();

        let mut ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["c1", "c3"]);
        assert_eq!(records[0].get("offence_fine"), Some(&json!(1500)));

        let opened = feed.opened();
        assert_eq!(opened.len(), 1);
        assert!(opened[0].where_clause().unwrap().contains("acme"));

        let stats = controller.cache_stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.entries[0].record_count, 2);
        assert_eq!(store.len().await.unwrap(), 2);

        let progress = controller.snapshot();
        assert_eq!(progress.phase, SyncPhase::Complete);
        assert_eq!(progress.search_result_count, 2);
        assert_eq!(progress.last_search.as_deref(), Some("Search: \"acme\""));
    }

    #[tokio::test]
    async fn test_repeat_search_is_served_from_cache() {
        let feed = seeded_feed();
        let controller = controller(&feed, Arc::new(MemoryStore::new()), test_config());

        controller.search(&SearchParams::term("acme")).await.unwrap();
        let before = controller.cache_stats().entries[0].idle_ms;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let again = controller.search(&SearchParams::term("  ACME ")).await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(feed.open_count(), 1);
        assert!(controller.cache_stats().entries[0].idle_ms <= before + 1);
    }

    #[tokio::test]
    async fn test_search_timeout_leaves_cache_untouched() {
        let feed = seeded_feed();
        feed.hold_snapshots(true);
        let config = AppConfig { search_timeout_ms: 100, ..test_config() };
        let controller = controller(&feed, Arc::new(MemoryStore::new()), config);

        let err = controller.search(&SearchParams::term("acme")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(controller.cache_stats().size, 0);
        assert_eq!(feed.active_subscriptions(), 0);

        let progress = controller.snapshot();
        assert_eq!(progress.phase, SyncPhase::Idle);
        assert_eq!(progress.error.unwrap().code, "TIMEOUT");
    }

    #[tokio::test]
    async fn test_invalid_dates_are_rejected_before_opening() {
        let feed = seeded_feed();
        let controller = controller(&feed, Arc::new(MemoryStore::new()), test_config());
        let params = SearchParams { date_from: Some("01/02/2024".into()), ..Default::default() };

        assert!(matches!(controller.search(&params).await, Err(Error::InvalidInput(_))));
        assert_eq!(feed.open_count(), 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_closes_oldest_search() {
        let feed = seeded_feed();
        let controller = controller(&feed, Arc::new(MemoryStore::new()), AppConfig { max_shapes: 1, ..test_config() });

        controller.search(&SearchParams::term("acme")).await.unwrap();
        controller.search(&SearchParams::term("beta")).await.unwrap();

        let stats = controller.cache_stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.entries[0].key, "search_term:beta");
        assert_eq!(feed.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_baseline_keeps_newest_records() {
        let feed = seeded_feed();
        let store = Arc::new(MemoryStore::new());
        let controller = controller(&feed, store.clone(), AppConfig { baseline_limit: 2, ..test_config() });
        let mut rx = controller.progress();

        controller.init().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| p.phase == SyncPhase::BaselineReady))
            .await
            .unwrap()
            .unwrap();

        let ids: Vec<String> = controller.baseline().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c2", "c1"]);
        assert_eq!(store.len().await.unwrap(), 2);

        // an empty search returns the baseline without a new subscription
        let opened = feed.open_count();
        let all = controller.search(&SearchParams::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(feed.open_count(), opened);
        controller.disconnect();
    }

    #[tokio::test]
    async fn test_live_changes_reach_store_and_baseline() {
        let feed = seeded_feed();
        let store = Arc::new(MemoryStore::new());
        let controller = controller(&feed, store.clone(), AppConfig { baseline_limit: 2, ..test_config() });
        let mut rx = controller.progress();

        controller.init().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| p.phase == SyncPhase::BaselineReady))
            .await
            .unwrap()
            .unwrap();

        feed.publish("cases", vec![ChangeMessage::insert(case("c9", "Gamma", "2025-01-01"))]);
        let mut results = controller.results();
        tokio::time::timeout(Duration::from_secs(5), results.wait_for(|r| r.first().is_some_and(|r| r.id == "c9")))
            .await
            .unwrap()
            .unwrap();

        let ids: Vec<String> = controller.baseline().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c9", "c2"]);
        assert!(store.get("c9").await.unwrap().is_some());
        controller.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_closes_everything() {
        let feed = seeded_feed();
        let controller = controller(&feed, Arc::new(MemoryStore::new()), test_config());

        controller.init().await.unwrap();
        controller.search(&SearchParams::term("acme")).await.unwrap();
        assert_eq!(feed.active_subscriptions(), 3);

        controller.disconnect();
        assert_eq!(feed.active_subscriptions(), 0);
        assert_eq!(controller.cache_stats().size, 0);
        assert_eq!(controller.snapshot().phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_search_in_flight() {
        let feed = seeded_feed();
        feed.hold_snapshots(true);
        let store = Arc::new(MemoryStore::new());
        let controller =
            Arc::new(controller(&feed, store.clone(), AppConfig { search_timeout_ms: 5_000, ..test_config() }));

        let searching = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.search(&SearchParams::term("acme")).await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while feed.active_subscriptions() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        controller.disconnect();
        assert_eq!(feed.active_subscriptions(), 0);

        feed.publish("cases", vec![ChangeMessage::insert(case("late", "Acme Late", "2024-07-01"))]);
        let result = tokio::time::timeout(Duration::from_secs(5), searching).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Connection(_))));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("late").await.unwrap().is_none());
        assert_eq!(controller.cache_stats().size, 0);
        assert_eq!(controller.snapshot().phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_dropped_search_closes_its_subscription() {
        let feed = seeded_feed();
        feed.hold_snapshots(true);
        let config = AppConfig { search_timeout_ms: 5_000, ..test_config() };
        let controller = controller(&feed, Arc::new(MemoryStore::new()), config);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), controller.search(&SearchParams::term("acme"))).await;
        assert!(abandoned.is_err());
        assert_eq!(feed.active_subscriptions(), 0);
        assert_eq!(controller.cache_stats().size, 0);
    }

    #[test]
    fn test_baseline_window_orders_undated_last() {
        let mut window = BaselineWindow::new(3, "offence_action_date");
        for record in [
            Record::new("b"),
            Record::new("a").with("offence_action_date", "2020-01-01"),
            Record::new("c").with("offence_action_date", "2022-01-01"),
            Record::new("d").with("offence_action_date", "2021-01-01"),
        ] {
            window.apply(&ChangeMessage::insert(record), &[]);
        }
        window.truncate();

        let ids: Vec<String> = window.sorted().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c", "d", "a"]);
        assert!(!window.apply(&ChangeMessage::update(Record::new("b").with("x", 1)), &[]));
    }

    #[test]
    fn test_collect_records_dedups_by_id() {
        let batch = vec![
            ChangeMessage::insert(Record::new("x").with("v", 1)),
            ChangeMessage::insert(Record::new("y").with("v", 1)),
            ChangeMessage::update(Record::new("x").with("v", 2)),
            ChangeMessage::delete("z"),
        ];
        let records = collect_records(batch, &[]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("v"), Some(&json!(2)));
    }
}
