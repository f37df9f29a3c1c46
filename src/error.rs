//! Error taxonomy (§7). One enum per boundary, `thiserror`-derived, the
//! same shape as the teacher's `AiError` (`ai/mod.rs`): a flat list of
//! variants with `#[from]` conversions where a dependency error maps 1:1.

use thiserror::Error;

/// Errors raised while loading or validating configuration. Fatal at
/// startup — never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors surfaced by the Tracker Adapter boundary.
#[derive(Debug, Error, Clone)]
pub enum TrackerError {
    #[error("tracker unavailable: {0}")]
    Unavailable(String),

    #[error("root not found: {0}")]
    NotFound(String),

    #[error("tracker request timed out")]
    Timeout,
}

/// Errors surfaced by the Generator Adapter boundary.
#[derive(Debug, Error, Clone)]
pub enum GeneratorError {
    #[error("generator request failed: {0}")]
    RequestFailed(String),

    #[error("generator exhausted retries after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("generator response could not be parsed: {0}")]
    ParseError(String),
}

/// Errors raised by a single Sync Worker run. Worker-local errors never
/// propagate above the Scheduler (§7): the scheduler turns these into
/// `RootMonitorState.last_sync_result` updates.
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    #[error("root missing from tracker: {0}")]
    RootMissing(String),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Generator(#[from] GeneratorError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("validation error: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
