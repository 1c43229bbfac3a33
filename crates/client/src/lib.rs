//! Client-side sync orchestration for casefeed.
//!
//! This crate keeps a partial, continuously updated local replica of large
//! remote record sets:
//!
//! - [`ProgressiveSyncController`] loads a recent partition first, then backfills history
//! - [`OnDemandCacheController`] keeps a capped baseline live and materializes searches
//!   on demand, bounded by an LRU shape cache
//! - [`MessageBatcher`] applies bursts of change messages in yielding chunks
//! - [`SyncSession`] owns all of the above for one application session

pub mod batcher;
pub mod feed;
pub mod on_demand;
pub mod progress;
pub mod progressive;
pub mod session;
pub mod stream;

pub use batcher::{BatcherStats, MessageBatcher, TokioYielder, Yielder, apply_change};
pub use feed::MemoryFeed;
pub use on_demand::OnDemandCacheController;
pub use progress::{NoopNotifier, ProgressError, RefreshReason, SyncPhase, SyncProgress, ViewNotifier};
pub use progressive::ProgressiveSyncController;
pub use session::{CollectionBinding, SyncSession};
pub use stream::{ActiveStream, StreamGuard};
