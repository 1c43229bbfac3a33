//! Core types and shared functionality for casefeed.
//!
//! This crate provides:
//! - Record, change-message and collection types
//! - Cache key, description and predicate derivation for searches
//! - The remote shape subscription boundary
//! - LRU-bounded shape cache
//! - Local replica stores (in-memory and SQLite)
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod collection;
pub mod config;
pub mod error;
pub mod query;
pub mod record;
pub mod shape;
pub mod store;

pub use cache::{CacheEntry, CacheStats, ShapeCacheManager};
pub use collection::CollectionSpec;
pub use config::{AppConfig, BatcherConfig};
pub use error::Error;
pub use query::{Predicate, SearchParams, generate_cache_key, generate_search_description};
pub use record::{ChangeBatch, ChangeMessage, ControlMessage, Operation, Record, change_count, coerce_numeric};
pub use shape::{
    BatchResult, BatchSender, BatchStream, CloseSubscription, Disposable, ShapeMode, ShapeRequest, ShapeSource,
    Subscription, SubscriptionHandle, batch_channel,
};
pub use store::{LocalStore, MemoryStore, ReplicaCollection, ReplicaDb};
