//! Sync tuning knobs, loaded through figment.
//!
//! Covers shape cache capacity, batching, phase delays and the search timeout.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Settings for one sync session.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (CASEFEED_*)
/// 2. TOML config file (if CASEFEED_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite replica database.
    ///
    /// Set via CASEFEED_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Maximum number of cached search shapes kept subscribed at once.
    ///
    /// Set via CASEFEED_MAX_SHAPES environment variable.
    #[serde(default = "default_max_shapes")]
    pub max_shapes: usize,

    /// Buffered message count that triggers an immediate flush.
    ///
    /// Set via CASEFEED_FLUSH_THRESHOLD environment variable.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Messages applied per chunk before yielding to the scheduler.
    ///
    /// Set via CASEFEED_CHUNK_SIZE environment variable.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Idle window after the last arrival before a partial buffer is flushed.
    ///
    /// Set via CASEFEED_DEBOUNCE_MS environment variable.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Delay between recent-data readiness and the start of historical backfill.
    ///
    /// Set via CASEFEED_HISTORICAL_DELAY_MS environment variable.
    #[serde(default = "default_historical_delay_ms")]
    pub historical_delay_ms: u64,

    /// Width of the "recent" partition in days.
    ///
    /// Set via CASEFEED_RECENT_WINDOW_DAYS environment variable.
    #[serde(default = "default_recent_window_days")]
    pub recent_window_days: u32,

    /// Number of most-recently-dated records kept in the on-demand baseline.
    ///
    /// Set via CASEFEED_BASELINE_LIMIT environment variable.
    #[serde(default = "default_baseline_limit")]
    pub baseline_limit: usize,

    /// How long an on-demand search waits for its first batch.
    ///
    /// Set via CASEFEED_SEARCH_TIMEOUT_MS environment variable.
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./casefeed-replica.sqlite")
}

fn default_max_shapes() -> usize {
    10
}

fn default_flush_threshold() -> usize {
    100
}

fn default_chunk_size() -> usize {
    50
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_historical_delay_ms() -> u64 {
    500
}

fn default_recent_window_days() -> u32 {
    365
}

fn default_baseline_limit() -> usize {
    1000
}

fn default_search_timeout_ms() -> u64 {
    10_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_shapes: default_max_shapes(),
            flush_threshold: default_flush_threshold(),
            chunk_size: default_chunk_size(),
            debounce_ms: default_debounce_ms(),
            historical_delay_ms: default_historical_delay_ms(),
            recent_window_days: default_recent_window_days(),
            baseline_limit: default_baseline_limit(),
            search_timeout_ms: default_search_timeout_ms(),
        }
    }
}

/// Tuning knobs for the message batcher, derived from [`AppConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
    pub flush_threshold: usize,
    pub chunk_size: usize,
    pub debounce: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        AppConfig::default().batcher()
    }
}

impl AppConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn historical_delay(&self) -> Duration {
        Duration::from_millis(self.historical_delay_ms)
    }

    /// Search first-batch window as Duration for use with tokio.
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn batcher(&self) -> BatcherConfig {
        BatcherConfig { flush_threshold: self.flush_threshold, chunk_size: self.chunk_size, debounce: self.debounce() }
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `CASEFEED_`
    /// 2. TOML file from `CASEFEED_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("CASEFEED_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("CASEFEED_")
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
