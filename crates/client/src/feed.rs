//! In-process shape source.
//!
//! [`MemoryFeed`] serves seeded datasets the way a remote change feed would:
//! a full subscription receives its matching rows as a snapshot (in insert
//! batches, then an `up-to-date` control message), and every subscription on a
//! resource receives later published changes that match its predicate.
//! It also records each opened request so callers can inspect traffic.

use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use casefeed_core::{
    BatchSender, ChangeBatch, ChangeMessage, CloseSubscription, ControlMessage, Error, Operation, Record, ShapeMode,
    ShapeRequest, ShapeSource, Subscription, SubscriptionHandle, batch_channel,
};
use parking_lot::{Mutex, RwLock};

const DEFAULT_SNAPSHOT_BATCH: usize = 500;

struct Subscriber {
    request: ShapeRequest,
    tx: BatchSender,
}

impl Subscriber {
    fn wants(&self, record: &Record) -> bool {
        self.request.predicate.as_ref().is_none_or(|p| p.matches(record))
    }
}

struct FeedInner {
    datasets: RwLock<HashMap<String, BTreeMap<String, Record>>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    opened: Mutex<Vec<ShapeRequest>>,
    next_id: AtomicU64,
    snapshot_batch: usize,
    fail_next_open: Mutex<Option<String>>,
    fail_close: AtomicBool,
    hold_snapshots: AtomicBool,
}

/// In-memory [`ShapeSource`] over seeded datasets. Cloning shares state.
#[derive(Clone)]
pub struct MemoryFeed {
    inner: Arc<FeedInner>,
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::with_snapshot_batch(DEFAULT_SNAPSHOT_BATCH)
    }

    /// Feed whose snapshots are split into batches of `size` rows.
    pub fn with_snapshot_batch(size: usize) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                datasets: RwLock::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                opened: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                snapshot_batch: size.max(1),
                fail_next_open: Mutex::new(None),
                fail_close: AtomicBool::new(false),
                hold_snapshots: AtomicBool::new(false),
            }),
        }
    }

    /// Add records to a resource without notifying subscribers.
    pub fn seed(&self, resource: &str, records: impl IntoIterator<Item = Record>) {
        let mut datasets = self.inner.datasets.write();
        let rows = datasets.entry(resource.to_string()).or_default();
        for record in records {
            rows.insert(record.id.clone(), record);
        }
    }

    /// Seed a resource from newline-delimited JSON objects. Blank lines are skipped.
    ///
    /// Returns the number of records loaded.
    pub fn load_ndjson(&self, resource: &str, reader: impl BufRead) -> Result<usize, Error> {
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::InvalidInput(format!("line {}: {e}", index + 1)))?;
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(&line)
                .map_err(|e| Error::InvalidInput(format!("line {}: {e}", index + 1)))?;
            let record = Record::from_value(value)
                .map_err(|e| Error::InvalidInput(format!("line {}: {e}", index + 1)))?;
            records.push(record);
        }
        let count = records.len();
        self.seed(resource, records);
        Ok(count)
    }

    /// Apply changes to a resource and fan them out to matching subscriptions.
    pub fn publish(&self, resource: &str, batch: ChangeBatch) {
        let mut resolved: Vec<(ChangeMessage, Option<Record>)> = Vec::with_capacity(batch.len());
        {
            let mut datasets = self.inner.datasets.write();
            let rows = datasets.entry(resource.to_string()).or_default();
            for msg in batch {
                let current = match &msg {
                    ChangeMessage::Change { operation: Operation::Insert, value } => {
                        rows.insert(value.id.clone(), value.clone());
                        Some(value.clone())
                    }
                    ChangeMessage::Change { operation: Operation::Update, value } => {
                        let row = rows.entry(value.id.clone()).or_insert_with(|| Record::new(&value.id));
                        row.merge(value);
                        Some(row.clone())
                    }
                    ChangeMessage::Change { operation: Operation::Delete, value } => {
                        rows.remove(&value.id);
                        None
                    }
                    ChangeMessage::Control { .. } => None,
                };
                resolved.push((msg, current));
            }
        }

        let subscribers = self.inner.subscribers.lock();
        for subscriber in subscribers.values().filter(|s| s.request.resource == resource) {
            let outgoing: ChangeBatch = resolved
                .iter()
                .filter(|(msg, current)| match (msg, current) {
                    (ChangeMessage::Control { .. }, _) => true,
                    (_, Some(record)) => subscriber.wants(record),
                    (_, None) => true,
                })
                .map(|(msg, _)| msg.clone())
                .collect();
            if !outgoing.is_empty() {
                let _ = subscriber.tx.send(Ok(outgoing));
            }
        }
    }

    /// Deliver a stream error to every open subscription on `resource`.
    pub fn inject_error(&self, resource: &str, message: &str) {
        let subscribers = self.inner.subscribers.lock();
        for subscriber in subscribers.values().filter(|s| s.request.resource == resource) {
            let _ = subscriber.tx.send(Err(Error::Connection(message.to_string())));
        }
    }

    /// Make the next `open` fail with a connection error.
    pub fn fail_next_open(&self, message: &str) {
        *self.inner.fail_next_open.lock() = Some(message.to_string());
    }

    /// Make every `close` report an error (the subscription is still torn down).
    pub fn fail_closes(&self, fail: bool) {
        self.inner.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Stop sending snapshots to new full subscriptions.
    pub fn hold_snapshots(&self, hold: bool) {
        self.inner.hold_snapshots.store(hold, Ordering::SeqCst);
    }

    /// Every request opened so far, in order.
    pub fn opened(&self) -> Vec<ShapeRequest> {
        self.inner.opened.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.inner.opened.lock().len()
    }

    /// Subscriptions opened and not yet closed.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    fn snapshot_for(&self, request: &ShapeRequest) -> Vec<ChangeBatch> {
        let datasets = self.inner.datasets.read();
        let matching: Vec<ChangeMessage> = datasets
            .get(&request.resource)
            .map(|rows| {
                rows.values()
                    .filter(|r| request.predicate.as_ref().is_none_or(|p| p.matches(r)))
                    .cloned()
                    .map(ChangeMessage::insert)
                    .collect()
            })
            .unwrap_or_default();

        let mut batches: Vec<ChangeBatch> =
            matching.chunks(self.inner.snapshot_batch).map(<[ChangeMessage]>::to_vec).collect();
        batches.push(vec![ChangeMessage::control(ControlMessage::UpToDate)]);
        batches
    }
}

#[async_trait]
impl ShapeSource for MemoryFeed {
    async fn open(&self, request: ShapeRequest) -> Result<Subscription, Error> {
        self.inner.opened.lock().push(request.clone());

        if let Some(message) = self.inner.fail_next_open.lock().take() {
            return Err(Error::Connection(message));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, stream) = batch_channel();

        if request.mode == ShapeMode::Full && !self.inner.hold_snapshots.load(Ordering::SeqCst) {
            for batch in self.snapshot_for(&request) {
                let _ = tx.send(Ok(batch));
            }
        }

        tracing::debug!(
            resource = %request.resource,
            mode = %request.mode,
            predicate = request.where_clause().unwrap_or_default(),
            id,
            "opened feed subscription"
        );

        let name = format!("{}#{id}", request.resource);
        self.inner.subscribers.lock().insert(id, Subscriber { request, tx });
        let closer = FeedCloser { feed: Arc::downgrade(&self.inner), id };

        Ok(Subscription { handle: SubscriptionHandle::new(name, Box::new(closer)), stream })
    }
}

struct FeedCloser {
    feed: Weak<FeedInner>,
    id: u64,
}

impl CloseSubscription for FeedCloser {
    fn close(&self) -> Result<(), Error> {
        let Some(feed) = self.feed.upgrade() else {
            return Ok(());
        };
        feed.subscribers.lock().remove(&self.id);
        if feed.fail_close.load(Ordering::SeqCst) {
            return Err(Error::Dispose(format!("subscription {} did not acknowledge close", self.id)));
        }
        Ok(())
    }
}
