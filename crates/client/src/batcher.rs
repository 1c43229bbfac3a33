//! Chunked application of change bursts to the local store.
//!
//! ### Flush policy
//! - Messages are buffered per stream.
//! - A buffer reaching `flush_threshold` flushes immediately.
//! - Otherwise a flush fires after `debounce` with no new arrivals.
//!
//! ### Apply policy
//! - A flush drains the whole buffer and applies it in `chunk_size` chunks,
//!   yielding to the scheduler between chunks.
//! - Control messages are skipped.
//! - A message that fails to apply is logged and dropped; the flush continues.
//! - Within a stream, flushes are serialized, so messages apply in delivery order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use casefeed_core::{BatcherConfig, ChangeBatch, ChangeMessage, Error, LocalStore, Operation, coerce_numeric};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::stream::StreamGuard;

/// Hands control back to the scheduler between chunks.
#[async_trait]
pub trait Yielder: Send + Sync {
    async fn yield_now(&self);
}

/// Default [`Yielder`] backed by `tokio::task::yield_now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioYielder;

#[async_trait]
impl Yielder for TokioYielder {
    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}

/// Apply one change message to `store`.
///
/// Returns `Ok(false)` for control messages. Numeric fields are coerced first;
/// inserts fill absent numeric fields with `null`, updates leave them alone.
pub async fn apply_change(
    store: &dyn LocalStore, numeric_fields: &[String], msg: ChangeMessage,
) -> Result<bool, Error> {
    let ChangeMessage::Change { operation, mut value } = msg else {
        return Ok(false);
    };

    if value.id.trim().is_empty() {
        return Err(Error::Apply(format!("{operation:?} message has an empty id")));
    }

    let result = match operation {
        Operation::Insert => {
            coerce_numeric(&mut value, numeric_fields, true);
            store.insert(value.clone()).await
        }
        Operation::Update => {
            coerce_numeric(&mut value, numeric_fields, false);
            store.update(&value.id, &value.fields).await
        }
        Operation::Delete => store.delete(&value.id).await,
    };

    result
        .map(|_| true)
        .map_err(|e| Error::Apply(format!("{operation:?} {}: {e}", value.id)))
}

/// Counters across all streams of one batcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    pub applied: u64,
    pub dropped: u64,
    pub flushes: u64,
}

#[derive(Debug)]
struct StreamBuffer {
    guard: StreamGuard,
    cancelled: AtomicBool,
    pending: Mutex<Vec<ChangeMessage>>,
    debounce: Mutex<Option<JoinHandle<()>>>,
    apply_lock: tokio::sync::Mutex<()>,
}

impl StreamBuffer {
    fn new(guard: StreamGuard) -> Self {
        Self {
            guard,
            cancelled: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            debounce: Mutex::new(None),
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn is_live(&self) -> bool {
        self.guard.is_active() && !self.cancelled.load(Ordering::Acquire)
    }

    fn disarm(&self) {
        if let Some(timer) = self.debounce.lock().take() {
            timer.abort();
        }
    }
}

struct BatcherInner {
    store: Arc<dyn LocalStore>,
    numeric_fields: Vec<String>,
    config: BatcherConfig,
    yielder: Arc<dyn Yielder>,
    streams: Mutex<HashMap<String, Arc<StreamBuffer>>>,
    applied: AtomicU64,
    dropped: AtomicU64,
    flushes: AtomicU64,
}

/// Buffers change messages per stream and applies them in yielding chunks.
///
/// Cloning shares the buffers.
#[derive(Clone)]
pub struct MessageBatcher {
    inner: Arc<BatcherInner>,
}

impl MessageBatcher {
    pub fn new(store: Arc<dyn LocalStore>, numeric_fields: Vec<String>, config: BatcherConfig) -> Self {
        Self::with_yielder(store, numeric_fields, config, Arc::new(TokioYielder))
    }

    pub fn with_yielder(
        store: Arc<dyn LocalStore>, numeric_fields: Vec<String>, config: BatcherConfig, yielder: Arc<dyn Yielder>,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                store,
                numeric_fields,
                config,
                yielder,
                streams: Mutex::new(HashMap::new()),
                applied: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                flushes: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.inner.store
    }

    /// Buffer a batch for `stream`, flushing inline once the threshold is reached.
    ///
    /// Nothing is buffered once `guard` is cancelled.
    pub async fn push(&self, stream: &str, guard: &StreamGuard, batch: ChangeBatch) {
        if !guard.is_active() {
            return;
        }

        let buffer = self.buffer_for(stream, guard);
        let buffered = {
            let mut pending = buffer.pending.lock();
            pending.extend(batch.into_iter().filter(|msg| !msg.is_control()));
            pending.len()
        };

        if buffered == 0 {
            return;
        }

        if buffered >= self.inner.config.flush_threshold {
            buffer.disarm();
            BatcherInner::flush_buffer(&self.inner, stream, &buffer).await;
        } else {
            self.arm_debounce(stream, buffer);
        }
    }

    /// Flush `stream` now, waiting for any flush already running on it.
    pub async fn flush(&self, stream: &str) {
        let buffer = self.inner.streams.lock().get(stream).cloned();
        if let Some(buffer) = buffer {
            buffer.disarm();
            BatcherInner::flush_buffer(&self.inner, stream, &buffer).await;
        }
    }

    pub async fn flush_all(&self) {
        let names: Vec<String> = self.inner.streams.lock().keys().cloned().collect();
        for name in names {
            self.flush(&name).await;
        }
    }

    /// Drop buffered messages and timers for `stream`; a running flush stops at its next chunk.
    pub fn cancel(&self, stream: &str) {
        let removed = self.inner.streams.lock().remove(stream);
        if let Some(buffer) = removed {
            cancel_buffer(stream, &buffer);
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<(String, Arc<StreamBuffer>)> = self.inner.streams.lock().drain().collect();
        for (name, buffer) in drained {
            cancel_buffer(&name, &buffer);
        }
    }

    /// Drop buffers whose stream guard was cancelled elsewhere, returning how many went.
    pub fn prune(&self) -> usize {
        let mut streams = self.inner.streams.lock();
        let before = streams.len();
        streams.retain(|name, buffer| {
            let live = buffer.is_live();
            if !live {
                cancel_buffer(name, buffer);
            }
            live
        });
        before - streams.len()
    }

    /// Buffered, not yet applied messages for `stream`.
    pub fn pending(&self, stream: &str) -> usize {
        self.inner
            .streams
            .lock()
            .get(stream)
            .map(|buffer| buffer.pending.lock().len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            applied: self.inner.applied.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            flushes: self.inner.flushes.load(Ordering::Relaxed),
        }
    }

    fn buffer_for(&self, stream: &str, guard: &StreamGuard) -> Arc<StreamBuffer> {
        let mut streams = self.inner.streams.lock();
        let stale = streams.get(stream).is_some_and(|buffer| !buffer.is_live());
        if stale {
            streams.remove(stream);
        }
        streams
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(StreamBuffer::new(guard.clone())))
            .clone()
    }

    fn arm_debounce(&self, stream: &str, buffer: Arc<StreamBuffer>) {
        let inner = self.inner.clone();
        let name = stream.to_string();
        let delay = self.inner.config.debounce;
        let timer_buffer = buffer.clone();

        let mut slot = buffer.debounce.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Whoever takes the handle owns this flush; a push that finds the slot empty won't abort us.
            if timer_buffer.debounce.lock().take().is_none() {
                return;
            }
            BatcherInner::flush_buffer(&inner, &name, &timer_buffer).await;
        }));
    }
}

impl BatcherInner {
    async fn flush_buffer(inner: &Arc<BatcherInner>, stream: &str, buffer: &StreamBuffer) {
        let _serialized = buffer.apply_lock.lock().await;

        let drained = std::mem::take(&mut *buffer.pending.lock());
        if drained.is_empty() {
            return;
        }

        inner.flushes.fetch_add(1, Ordering::Relaxed);
        let total = drained.len();
        let chunk_size = inner.config.chunk_size.max(1);
        let mut applied = 0usize;
        let mut messages = drained.into_iter().peekable();

        while messages.peek().is_some() {
            for msg in messages.by_ref().take(chunk_size) {
                if !buffer.is_live() {
                    tracing::debug!(stream, applied, total, "stream cancelled during flush");
                    return;
                }
                match apply_change(inner.store.as_ref(), &inner.numeric_fields, msg).await {
                    Ok(true) => {
                        applied += 1;
                        inner.applied.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        inner.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(stream, error = %e, "dropping change message that failed to apply");
                    }
                }
            }
            inner.yielder.yield_now().await;
        }

        tracing::debug!(stream, applied, total, "flushed change batch");
    }
}

fn cancel_buffer(stream: &str, buffer: &StreamBuffer) {
    buffer.cancelled.store(true, Ordering::Release);
    buffer.disarm();
    let discarded = std::mem::take(&mut *buffer.pending.lock()).len();
    if discarded > 0 {
        tracing::debug!(stream, discarded, "discarded buffered messages on cancel");
    }
}
