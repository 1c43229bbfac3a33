//! Bounded cache of live search shapes.
//!
//! Each entry owns an open subscription. The cache holds at most `max_shapes`
//! entries and evicts the least-recently-used one when a new key arrives at
//! capacity. An entry's subscription is always disposed before the entry
//! leaves the map, and disposal failures are logged rather than propagated.

pub mod manager;

pub use manager::{CacheEntry, CacheStats, EntryStats, ShapeCacheManager};
