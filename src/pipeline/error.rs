//! Error taxonomy for the aggregation pipeline
//!
//! Per-sample errors (`MalformedSample`, `UnknownSource`, `LateWindowDiscarded`,
//! `AccumulatorOverflow`) stay local to the sample that caused them. Persistence and
//! rollup-completeness problems are surfaced through `EngineStats` and engine events.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed sample from '{source_id}': {reason}")]
    MalformedSample { source_id: String, reason: String },

    #[error("sample for unregistered source '{0}'")]
    UnknownSource(String),

    #[error("invalid source registration '{source_id}': {reason}")]
    InvalidSource { source_id: String, reason: String },

    #[error(
        "late sample from '{source_id}' for window {window_start} discarded (open window {open_window_start})"
    )]
    LateWindowDiscarded {
        source_id: String,
        window_start: i64,
        open_window_start: i64,
    },

    #[error("accumulator overflow for '{source_id}' in window {window_start}")]
    AccumulatorOverflow { source_id: String, window_start: i64 },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("persistence failed for {failed_batches} batch(es): {last_error}")]
    PersistenceFailure {
        failed_batches: usize,
        last_error: String,
    },

    #[error(
        "rollup for window {window_start} forced after grace period ({active_sources}/{known_sources} sources)"
    )]
    IncompleteRollupTimeout {
        window_start: i64,
        active_sources: usize,
        known_sources: usize,
    },
}

impl EngineError {
    /// Conditions that are expected during normal operation and logged as warnings.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            EngineError::LateWindowDiscarded { .. } | EngineError::IncompleteRollupTimeout { .. }
        )
    }

    /// True for errors scoped to a single rejected sample.
    pub fn is_sample_local(&self) -> bool {
        matches!(
            self,
            EngineError::MalformedSample { .. }
                | EngineError::UnknownSource(_)
                | EngineError::LateWindowDiscarded { .. }
                | EngineError::AccumulatorOverflow { .. }
        )
    }
}

/// Errors raised by the time-series store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("schema directory not found: {0}")]
    SchemaNotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
