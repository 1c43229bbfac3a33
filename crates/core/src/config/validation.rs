//! Range checks run on every loaded `AppConfig`, whichever layer supplied the values.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `max_shapes` is outside 1..=100
    /// - `flush_threshold`, `chunk_size` or `baseline_limit` is 0
    /// - `chunk_size` exceeds `flush_threshold`
    /// - `search_timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `recent_window_days` is 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_shapes == 0 || self.max_shapes > 100 {
            return Err(ConfigError::Invalid { field: "max_shapes".into(), reason: "must be between 1 and 100".into() });
        }

        if self.flush_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "flush_threshold".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid { field: "chunk_size".into(), reason: "must be greater than 0".into() });
        }
        if self.chunk_size > self.flush_threshold {
            return Err(ConfigError::Invalid {
                field: "chunk_size".into(),
                reason: "must not exceed flush_threshold".into(),
            });
        }

        if self.search_timeout_ms < 100 {
            return Err(ConfigError::Invalid {
                field: "search_timeout_ms".into(),
                reason: "must be at least 100ms".into(),
            });
        }
        if self.search_timeout_ms > 300_000 {
            return Err(ConfigError::Invalid {
                field: "search_timeout_ms".into(),
                reason: "must not exceed 5 minutes (300000ms)".into(),
            });
        }

        if self.recent_window_days == 0 {
            return Err(ConfigError::Invalid {
                field: "recent_window_days".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.baseline_limit == 0 {
            return Err(ConfigError::Invalid { field: "baseline_limit".into(), reason: "must be greater than 0".into() });
        }

        if self.debounce_ms > 5_000 {
            tracing::warn!(
                debounce_ms = self.debounce_ms,
                "debounce_ms is unusually large; partial batches will reach the store slowly"
            );
        }

        Ok(())
    }
}
