//! LRU shape cache manager.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::shape::Disposable;

/// One cached shape and its subscription.
#[derive(Debug)]
pub struct CacheEntry<H> {
    pub key: String,
    pub description: String,
    pub handle: H,
    pub record_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Tie-breaker for entries touched within the same clock tick.
    access_seq: u64,
}

/// Read-only view of a cache entry for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryStats {
    pub key: String,
    pub description: String,
    pub record_count: usize,
    pub age_ms: i64,
    pub idle_ms: i64,
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_shapes: usize,
    pub total_records: usize,
    /// Most recently used first.
    pub entries: Vec<EntryStats>,
}

/// Bounded map of active subscriptions keyed by cache key, with LRU eviction.
///
/// Not internally synchronized; callers sharing it across tasks wrap it in a mutex.
#[derive(Debug)]
pub struct ShapeCacheManager<H: Disposable> {
    entries: HashMap<String, CacheEntry<H>>,
    max_shapes: usize,
    access_clock: u64,
}

impl<H: Disposable> ShapeCacheManager<H> {
    /// Create a cache holding at most `max_shapes` entries (minimum 1).
    pub fn new(max_shapes: usize) -> Self {
        Self { entries: HashMap::new(), max_shapes: max_shapes.max(1), access_clock: 0 }
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_shapes(&self) -> usize {
        self.max_shapes
    }

    /// Look up an entry, marking it as just used.
    ///
    /// A miss has no side effects.
    pub fn get(&mut self, key: &str) -> Option<&CacheEntry<H>> {
        if !self.entries.contains_key(key) {
            return None;
        }
        let seq = self.tick();
        let entry = self.entries.get_mut(key)?;
        touch(entry, seq);
        tracing::debug!(key, record_count = entry.record_count, "shape cache hit");
        Some(entry)
    }

    /// Insert or refresh an entry.
    ///
    /// A known key gets the new handle and count and is marked used; a handle it
    /// replaces is disposed. A new key at capacity first evicts the LRU entry.
    pub fn add(&mut self, key: &str, description: &str, handle: H, record_count: usize) {
        let seq = self.tick();

        if let Some(entry) = self.entries.get_mut(key) {
            let mut previous = std::mem::replace(&mut entry.handle, handle);
            entry.record_count = record_count;
            entry.description = description.to_string();
            touch(entry, seq);
            dispose_handle(key, &mut previous);
            return;
        }

        if self.entries.len() >= self.max_shapes {
            self.evict_lru();
        }

        let now = Utc::now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                description: description.to_string(),
                handle,
                record_count,
                created_at: now,
                last_accessed_at: now,
                access_seq: seq,
            },
        );
        tracing::debug!(key, size = self.entries.len(), max_shapes = self.max_shapes, "shape cached");
    }

    /// Dispose an entry's subscription and drop it. Returns whether the key existed.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => dispose_handle(key, &mut entry.handle),
            None => return false,
        }
        self.entries.remove(key);
        true
    }

    /// Dispose and drop every entry.
    pub fn clear(&mut self) {
        for (key, entry) in self.entries.iter_mut() {
            dispose_handle(key, &mut entry.handle);
        }
        let cleared = self.entries.len();
        self.entries.clear();
        if cleared > 0 {
            tracing::debug!(cleared, "shape cache cleared");
        }
    }

    pub fn get_stats(&self) -> CacheStats {
        let now = Utc::now();
        let mut ordered: Vec<&CacheEntry<H>> = self.entries.values().collect();
        ordered.sort_by(|a, b| (b.last_accessed_at, b.access_seq).cmp(&(a.last_accessed_at, a.access_seq)));

        CacheStats {
            size: self.entries.len(),
            max_shapes: self.max_shapes,
            total_records: self.entries.values().map(|e| e.record_count).sum(),
            entries: ordered
                .into_iter()
                .map(|e| EntryStats {
                    key: e.key.clone(),
                    description: e.description.clone(),
                    record_count: e.record_count,
                    age_ms: (now - e.created_at).num_milliseconds(),
                    idle_ms: (now - e.last_accessed_at).num_milliseconds(),
                })
                .collect(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.access_clock += 1;
        self.access_clock
    }

    /// Linear scan for the smallest `(last_accessed_at, access_seq)`.
    fn evict_lru(&mut self) {
        let Some(key) = self
            .entries
            .values()
            .min_by_key(|e| (e.last_accessed_at, e.access_seq))
            .map(|e| e.key.clone())
        else {
            return;
        };

        tracing::debug!(key = %key, "evicting least recently used shape");
        self.remove(&key);
    }
}

/// Mark an entry used, never moving its timestamp backwards.
fn touch<H>(entry: &mut CacheEntry<H>, seq: u64) {
    entry.last_accessed_at = entry.last_accessed_at.max(Utc::now());
    entry.access_seq = seq;
}

fn dispose_handle<H: Disposable>(key: &str, handle: &mut H) {
    if let Err(e) = handle.dispose() {
        tracing::warn!(key, error = %e, "failed to dispose cached shape subscription");
    }
}
