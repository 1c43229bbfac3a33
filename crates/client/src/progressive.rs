//! Two-phase replication of a collection small enough to copy whole.
//!
//! `start()` subscribes to the recent partition first. The first non-empty
//! recent batch is flushed, `recent_cases_loaded` flips and the view is told to
//! refresh; after `historical_delay` the complementary historical partition is
//! subscribed as a best-effort backfill.
//!
//! ### Failure policy
//! - Failing to open the recent stream, or an error on it before its first
//!   batch lands, halts the sync and returns the phase to `Idle`. `start()`
//!   may be called again.
//! - Later recent errors and all historical errors are recorded on the
//!   progress value only.
//!
//! ### Cancellation
//! Every spawned task carries the generation it was started under. `stop()`
//! bumps the generation before tearing streams down, so a task racing the
//! teardown finds itself stale and touches nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use casefeed_core::{
    AppConfig, BatchStream, CollectionSpec, Error, LocalStore, Predicate, ShapeRequest, ShapeSource, Subscription,
    change_count,
};
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::batcher::MessageBatcher;
use crate::progress::{ProgressError, RefreshReason, SyncPhase, SyncProgress, ViewNotifier};
use crate::stream::{ActiveStream, StreamGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partition {
    Recent,
    Historical,
}

impl Partition {
    fn label(self) -> &'static str {
        match self {
            Partition::Recent => "recent",
            Partition::Historical => "historical",
        }
    }
}

#[derive(Default)]
struct Streams {
    recent: Option<ActiveStream>,
    historical: Option<ActiveStream>,
    backfill_timer: Option<JoinHandle<()>>,
    opening: bool,
}

struct Inner {
    spec: CollectionSpec,
    source: Arc<dyn ShapeSource>,
    batcher: MessageBatcher,
    notifier: Arc<dyn ViewNotifier>,
    historical_delay: Duration,
    recent_window_days: u32,
    progress: watch::Sender<SyncProgress>,
    streams: Mutex<Streams>,
    generation: AtomicU64,
}

/// Recent-first, historical-later replication of one collection.
pub struct ProgressiveSyncController {
    inner: Arc<Inner>,
}

impl ProgressiveSyncController {
    pub fn new(
        spec: CollectionSpec, source: Arc<dyn ShapeSource>, store: Arc<dyn LocalStore>,
        notifier: Arc<dyn ViewNotifier>, config: &AppConfig,
    ) -> Self {
        let batcher = MessageBatcher::new(store, spec.numeric_fields.clone(), config.batcher());
        Self::with_batcher(spec, source, batcher, notifier, config)
    }

    /// Build around an existing batcher, e.g. one with a custom yielder.
    pub fn with_batcher(
        spec: CollectionSpec, source: Arc<dyn ShapeSource>, batcher: MessageBatcher, notifier: Arc<dyn ViewNotifier>,
        config: &AppConfig,
    ) -> Self {
        let (progress, _) = watch::channel(SyncProgress::default());
        Self {
            inner: Arc::new(Inner {
                spec,
                source,
                batcher,
                notifier,
                historical_delay: config.historical_delay(),
                recent_window_days: config.recent_window_days,
                progress,
                streams: Mutex::new(Streams::default()),
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

    /// Receiver for progress updates.
    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.inner.progress.subscribe()
    }

    /// Current progress.
    pub fn snapshot(&self) -> SyncProgress {
        self.inner.progress.borrow().clone()
    }

    /// Whether the recent subscription is open.
    pub fn is_running(&self) -> bool {
        self.inner.streams.lock().recent.is_some()
    }

    /// Begin syncing. A no-op while a sync is already running or starting.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the recent subscription cannot be opened;
    /// the error is also published on the progress value.
    pub async fn start(&self) -> Result<(), Error> {
        let generation = {
            let mut streams = self.inner.streams.lock();
            if streams.recent.is_some() || streams.opening {
                tracing::debug!(resource = %self.inner.spec.resource, "progressive sync already running");
                return Ok(());
            }
            streams.opening = true;
            self.inner.generation.load(Ordering::SeqCst)
        };
        let _opening = OpeningFlag { inner: &self.inner, generation };

        let cutoff = self.inner.cutoff();
        self.inner.progress.send_replace(SyncProgress {
            phase: SyncPhase::SyncingRecent,
            started_at: Some(Utc::now()),
            ..Default::default()
        });

        tracing::info!(resource = %self.inner.spec.resource, %cutoff, "starting progressive sync");
        let request = ShapeRequest::full(&self.inner.spec.resource, Some(Predicate::recent(&self.inner.spec, cutoff)));
        let opened = self.inner.source.open(request).await;

        if !self.inner.is_current(generation) {
            if let Ok(subscription) = opened {
                close_unused(subscription);
            }
            return Ok(());
        }

        match opened {
            Ok(subscription) => {
                Inner::attach(&self.inner, Partition::Recent, subscription, generation, cutoff);
                Ok(())
            }
            Err(e) => {
                tracing::error!(resource = %self.inner.spec.resource, error = %e, "failed to open recent subscription");
                self.inner.progress.send_modify(|p| {
                    p.phase = SyncPhase::Idle;
                    p.error = Some(ProgressError::from(&e));
                });
                Err(e)
            }
        }
    }

    /// Tear down every subscription and pending flush, and return to `Idle`.
    ///
    /// Safe to call in any state. Close failures are logged, never returned.
    pub fn stop(&self) {
        self.inner.shutdown_streams();
        self.inner.progress.send_modify(|p| p.phase = SyncPhase::Idle);
    }
}

impl Drop for ProgressiveSyncController {
    fn drop(&mut self) {
        self.inner.shutdown_streams();
    }
}

impl Inner {
    fn cutoff(&self) -> NaiveDate {
        Utc::now().date_naive() - chrono::Duration::days(i64::from(self.recent_window_days))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn stream_name(&self, partition: Partition) -> String {
        format!("{}:{}", self.spec.resource, partition.label())
    }

    fn shutdown_streams(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let (recent, historical, timer) = {
            let mut streams = self.streams.lock();
            streams.opening = false;
            (streams.recent.take(), streams.historical.take(), streams.backfill_timer.take())
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        for stream in [recent, historical].into_iter().flatten() {
            self.batcher.cancel(stream.name());
            stream.shutdown();
        }
    }

    /// Spawn the reader for an opened subscription and keep it as the partition's stream.
    fn attach(
        inner: &Arc<Inner>, partition: Partition, subscription: Subscription, generation: u64, cutoff: NaiveDate,
    ) {
        let (handle, batches) = subscription.split();
        let name = inner.stream_name(partition);
        let guard = StreamGuard::new();

        let mut streams = inner.streams.lock();
        if !inner.is_current(generation) {
            drop(streams);
            let mut handle = handle;
            if let Err(e) = handle.close() {
                tracing::warn!(stream = %name, error = %e, "failed to close stale subscription");
            }
            return;
        }

        let task = Inner::read(Arc::clone(inner), partition, guard.clone(), batches, generation, cutoff);
        let reader = tokio::spawn(task);
        let active = ActiveStream::new(name, handle, guard, reader);
        let slot = match partition {
            Partition::Recent => &mut streams.recent,
            Partition::Historical => &mut streams.historical,
        };
        if let Some(previous) = slot.replace(active) {
            previous.shutdown();
        }
    }

    async fn read(
        inner: Arc<Inner>, partition: Partition, guard: StreamGuard, mut batches: BatchStream, generation: u64,
        cutoff: NaiveDate,
    ) {
        let name = inner.stream_name(partition);
        let mut loaded = false;

        while let Some(next) = batches.next().await {
            if !guard.is_active() {
                break;
            }

            let batch = match next {
                Ok(batch) => batch,
                Err(e) => match partition {
                    Partition::Recent if !loaded => {
                        tracing::error!(stream = %name, error = %e, "recent stream failed, halting sync");
                        inner.halt(&e, generation);
                        break;
                    }
                    Partition::Recent | Partition::Historical => {
                        tracing::warn!(stream = %name, error = %e, "stream error after first batch");
                        inner.progress.send_modify(|p| p.error = Some(ProgressError::from(&e)));
                        continue;
                    }
                },
            };

            let count = change_count(&batch);
            if count == 0 {
                continue;
            }

            inner.progress.send_modify(|p| match partition {
                Partition::Recent => p.recent_count += count,
                Partition::Historical => p.historical_count += count,
            });
            inner.batcher.push(&name, &guard, batch).await;

            if loaded {
                continue;
            }
            loaded = true;
            inner.batcher.flush(&name).await;
            if !guard.is_active() || !inner.is_current(generation) {
                break;
            }
            inner.mark_loaded(partition);

            if partition == Partition::Recent {
                Inner::schedule_historical(&inner, generation, cutoff);
            }
        }

        tracing::debug!(stream = %name, "stream reader finished");
    }

    fn mark_loaded(&self, partition: Partition) {
        let now = Utc::now();
        let reason = match partition {
            Partition::Recent => {
                self.progress.send_modify(|p| {
                    p.recent_cases_loaded = true;
                    p.recent_complete_time = Some(now);
                });
                RefreshReason::RecentReady
            }
            Partition::Historical => {
                self.progress.send_modify(|p| {
                    p.phase = SyncPhase::Complete;
                    p.historical_cases_loaded = true;
                    p.full_complete_time = Some(now);
                });
                RefreshReason::HistoricalReady
            }
        };

        let progress = self.progress.borrow().clone();
        tracing::info!(
            resource = %self.spec.resource,
            partition = partition.label(),
            recent = progress.recent_count,
            historical = progress.historical_count,
            "partition loaded"
        );
        self.notifier.refresh(reason);
    }

    /// Stop after a recent-phase failure, keeping the error visible.
    fn halt(&self, err: &Error, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        self.shutdown_streams();
        self.progress.send_modify(|p| {
            p.phase = SyncPhase::Idle;
            p.error = Some(ProgressError::from(err));
        });
    }

    fn schedule_historical(inner: &Arc<Inner>, generation: u64, cutoff: NaiveDate) {
        let task_inner = Arc::clone(inner);
        let delay = inner.historical_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = Inner::start_historical(&task_inner, generation, cutoff).await {
                tracing::warn!(resource = %task_inner.spec.resource, error = %e, "historical backfill not started");
            }
        });

        let mut streams = inner.streams.lock();
        if inner.is_current(generation) {
            if let Some(previous) = streams.backfill_timer.replace(timer) {
                previous.abort();
            }
        } else {
            timer.abort();
        }
    }

    async fn start_historical(inner: &Arc<Inner>, generation: u64, cutoff: NaiveDate) -> Result<(), Error> {
        {
            let mut streams = inner.streams.lock();
            if !inner.is_current(generation) || streams.historical.is_some() {
                return Ok(());
            }
            // Detach our own handle; aborting it from here would cancel this task.
            streams.backfill_timer.take();
        }

        inner.progress.send_modify(|p| p.phase = SyncPhase::SyncingHistorical);
        tracing::info!(resource = %inner.spec.resource, %cutoff, "starting historical backfill");

        let request = ShapeRequest::full(&inner.spec.resource, Some(Predicate::historical(&inner.spec, cutoff)));
        match inner.source.open(request).await {
            Ok(subscription) => {
                Inner::attach(inner, Partition::Historical, subscription, generation, cutoff);
                Ok(())
            }
            Err(e) => {
                if inner.is_current(generation) {
                    inner.progress.send_modify(|p| p.error = Some(ProgressError::from(&e)));
                }
                Err(e)
            }
        }
    }
}

/// Clears `Streams::opening` once `start()` returns or its future is dropped.
struct OpeningFlag<'a> {
    inner: &'a Inner,
    generation: u64,
}

impl Drop for OpeningFlag<'_> {
    fn drop(&mut self) {
        let mut streams = self.inner.streams.lock();
        if self.inner.is_current(self.generation) {
            streams.opening = false;
        }
    }
}

fn close_unused(subscription: Subscription) {
    let (mut handle, _) = subscription.split();
    if let Err(e) = handle.close() {
        tracing::warn!(subscription = handle.id(), error = %e, "failed to close subscription opened after stop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeed;
    use crate::progress::NoopNotifier;
    use async_trait::async_trait;
    use casefeed_core::{ChangeMessage, MemoryStore, Record};
    use std::sync::atomic::AtomicBool;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct RecordingNotifier {
        reasons: SyncMutex<Vec<RefreshReason>>,
    }

    impl ViewNotifier for RecordingNotifier {
        fn refresh(&self, reason: RefreshReason) {
            self.reasons.lock().push(reason);
        }
    }

    fn test_config() -> AppConfig {
        AppConfig { historical_delay_ms: 20, debounce_ms: 5, ..Default::default() }
    }

    fn today() -> String {
        Utc::now().date_naive().to_string()
    }

    fn notice(id: &str, date: Option<&str>) -> Record {
        let record = Record::new(id).with("offender_name", "Acme Ltd");
        match date {
            Some(date) => record.with("notice_date", date),
            None => record,
        }
    }

    fn seeded_feed() -> MemoryFeed {
        let feed = MemoryFeed::new();
        let today = today();
        feed.seed(
            "notices",
            vec![
                notice("n1", Some(&today)),
                notice("n2", Some(&today)),
                notice("n3", Some(&today)),
                notice("n4", Some("2001-03-04")),
                notice("n5", None),
            ],
        );
        feed
    }

    async fn wait_for(rx: &mut watch::Receiver<SyncProgress>, want: impl Fn(&SyncProgress) -> bool) -> SyncProgress {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| want(p)))
            .await
            .expect("timed out waiting for progress")
            .expect("progress channel closed")
            .clone()
    }

    #[tokio::test]
    async fn test_recent_then_historical_completes() {
        let feed = seeded_feed();
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let controller = ProgressiveSyncController::new(
            CollectionSpec::notices(),
            Arc::new(feed.clone()),
            store.clone(),
            notifier.clone(),
            &test_config(),
        );
        let mut rx = controller.progress();

        controller.start().await.unwrap();

        let recent = wait_for(&mut rx, |p| p.recent_cases_loaded).await;
        assert_eq!(recent.recent_count, 3);
        assert!(recent.recent_complete_time.is_some());

        let done = wait_for(&mut rx, |p| p.phase == SyncPhase::Complete).await;
        assert!(done.historical_cases_loaded);
        assert_eq!(done.historical_count, 2);
        assert_eq!(done.total_synced(), 5);
        assert_eq!(store.len().await.unwrap(), 5);
        assert_eq!(*notifier.reasons.lock(), vec![RefreshReason::RecentReady, RefreshReason::HistoricalReady]);

        let opened = feed.opened();
        assert_eq!(opened.len(), 2);
        assert!(opened[0].where_clause().unwrap().contains(">="));
        assert!(opened[1].where_clause().unwrap().contains("IS NULL"));

        controller.stop();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let feed = seeded_feed();
        let controller = ProgressiveSyncController::new(
            CollectionSpec::notices(),
            Arc::new(feed.clone()),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopNotifier),
            &AppConfig { historical_delay_ms: 60_000, ..test_config() },
        );

        controller.start().await.unwrap();
        controller.start().await.unwrap();
        assert_eq!(feed.open_count(), 1);
        assert!(controller.is_running());

        controller.stop();
        assert!(!controller.is_running());
        assert_eq!(feed.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_resets_to_idle() {
        let feed = seeded_feed();
        feed.fail_next_open("connection refused");
        let controller = ProgressiveSyncController::new(
            CollectionSpec::notices(),
            Arc::new(feed.clone()),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopNotifier),
            &test_config(),
        );

        let err = controller.start().await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        let progress = controller.snapshot();
        assert_eq!(progress.phase, SyncPhase::Idle);
        assert_eq!(progress.error.unwrap().code, "CONNECTION_ERROR");

        // a retry succeeds
        controller.start().await.unwrap();
        assert!(controller.is_running());
        controller.stop();
    }

    #[tokio::test]
    async fn test_historical_failure_keeps_recent_data() {
        let feed = seeded_feed();
        let store = Arc::new(MemoryStore::new());
        let controller = ProgressiveSyncController::new(
            CollectionSpec::notices(),
            Arc::new(feed.clone()),
            store.clone(),
            Arc::new(NoopNotifier),
            &AppConfig { historical_delay_ms: 200, ..test_config() },
        );
        let mut rx = controller.progress();

        controller.start().await.unwrap();
        wait_for(&mut rx, |p| p.recent_cases_loaded).await;
        feed.fail_next_open("backfill refused");

        let failed = wait_for(&mut rx, |p| p.error.is_some()).await;
        assert_eq!(failed.phase, SyncPhase::SyncingHistorical);
        assert!(controller.is_running());
        assert_eq!(store.len().await.unwrap(), 3);
        controller.stop();
    }

    #[tokio::test]
    async fn test_recent_stream_error_halts() {
        let feed = MemoryFeed::new();
        let controller = ProgressiveSyncController::new(
            CollectionSpec::notices(),
            Arc::new(feed.clone()),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopNotifier),
            &test_config(),
        );
        let mut rx = controller.progress();

        controller.start().await.unwrap();
        feed.inject_error("notices", "socket closed");

        let halted = wait_for(&mut rx, |p| p.error.is_some()).await;
        assert_eq!(halted.phase, SyncPhase::Idle);
        assert!(!controller.is_running());
        assert_eq!(feed.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_stop_discards_later_changes() {
        let feed = MemoryFeed::new();
        let store = Arc::new(MemoryStore::new());
        let controller = ProgressiveSyncController::new(
            CollectionSpec::notices(),
            Arc::new(feed.clone()),
            store.clone(),
            Arc::new(NoopNotifier),
            &test_config(),
        );

        controller.start().await.unwrap();
        controller.stop();
        feed.publish("notices", vec![ChangeMessage::insert(notice("late", Some(&today())))]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.len().await.unwrap(), 0);
        assert_eq!(controller.snapshot().phase, SyncPhase::Idle);
        // stopping twice is harmless
        controller.stop();
    }

    #[tokio::test]
    async fn test_recent_error_after_load_keeps_sync_running() {
        let feed = seeded_feed();
        let store = Arc::new(MemoryStore::new());
        let controller = ProgressiveSyncController::new(
            CollectionSpec::notices(),
            Arc::new(feed.clone()),
            store.clone(),
            Arc::new(NoopNotifier),
            &test_config(),
        );
        let mut rx = controller.progress();

        controller.start().await.unwrap();
        wait_for(&mut rx, |p| p.phase == SyncPhase::Complete).await;
        assert_eq!(feed.active_subscriptions(), 2);

        feed.inject_error("notices", "socket reset");
        let errored = wait_for(&mut rx, |p| p.error.is_some()).await;
        assert_eq!(errored.phase, SyncPhase::Complete);
        assert!(errored.historical_cases_loaded);
        assert!(controller.is_running());
        assert_eq!(feed.active_subscriptions(), 2);

        // both streams still deliver
        feed.publish("notices", vec![ChangeMessage::insert(notice("n6", Some(&today())))]);
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get("n6").await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("live change never applied");

        controller.stop();
    }

    /// Never answers its first `open`.
    struct StallOnce {
        feed: MemoryFeed,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl ShapeSource for StallOnce {
        async fn open(&self, request: ShapeRequest) -> Result<Subscription, Error> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.feed.open(request).await
        }
    }

    #[tokio::test]
    async fn test_abandoned_start_can_be_retried() {
        let feed = seeded_feed();
        let source = Arc::new(StallOnce { feed: feed.clone(), stalled: AtomicBool::new(false) });
        let controller = ProgressiveSyncController::new(
            CollectionSpec::notices(),
            source,
            Arc::new(MemoryStore::new()),
            Arc::new(NoopNotifier),
            &AppConfig { historical_delay_ms: 60_000, ..test_config() },
        );

        let abandoned = tokio::time::timeout(Duration::from_millis(20), controller.start()).await;
        assert!(abandoned.is_err());
        assert!(!controller.is_running());

        controller.start().await.unwrap();
        assert!(controller.is_running());
        assert_eq!(feed.open_count(), 1);
        controller.stop();
    }
}
