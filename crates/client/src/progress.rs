//! Reactive progress values observed by the UI.
//!
//! Each controller owns one [`SyncProgress`] behind a `tokio::sync::watch`
//! channel; the UI holds receivers and never writes.

use casefeed_core::Error;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Sync phase.
///
/// Progressive sync moves `Idle -> SyncingRecent -> SyncingHistorical -> Complete`.
/// On-demand caching moves `Idle -> BaselineReady -> Searching -> Complete`, cycling
/// between `Searching` and `Complete` for later searches. Only `stop()`/`disconnect()`
/// returns a controller to `Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    SyncingRecent,
    SyncingHistorical,
    BaselineReady,
    Searching,
    Complete,
}

/// Error as presented to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ProgressError {
    fn from(err: &Error) -> Self {
        Self { code: err.code().to_string(), message: err.to_string() }
    }
}

/// Progress of one controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    /// Records received by the recent-partition subscription.
    pub recent_count: usize,
    /// Records received by the historical backfill.
    pub historical_count: usize,
    /// Records currently retained in the on-demand baseline.
    pub baseline_count: usize,
    /// Records returned by the last search.
    pub search_result_count: usize,
    /// Cached search shapes held open.
    pub cached_shapes: usize,
    pub recent_cases_loaded: bool,
    pub historical_cases_loaded: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub recent_complete_time: Option<DateTime<Utc>>,
    pub full_complete_time: Option<DateTime<Utc>>,
    pub baseline_ready_time: Option<DateTime<Utc>>,
    /// Description of the last search issued.
    pub last_search: Option<String>,
    pub error: Option<ProgressError>,
}

impl SyncProgress {
    pub fn total_synced(&self) -> usize {
        self.recent_count + self.historical_count
    }
}

/// Why the UI is asked to re-render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    RecentReady,
    HistoricalReady,
    BaselineReady,
    SearchResults,
}

/// UI collaborator told when freshly synced data is ready to show.
pub trait ViewNotifier: Send + Sync {
    fn refresh(&self, reason: RefreshReason);
}

/// Notifier for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl ViewNotifier for NoopNotifier {
    fn refresh(&self, _reason: RefreshReason) {}
}
