//! Observable engine state: counters and appended events

use super::error::EngineError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by the engine, ingestion loop and persistence worker
#[derive(Debug, Default)]
pub struct EngineStats {
    pub samples_ingested: AtomicU64,
    pub samples_malformed: AtomicU64,
    pub samples_unknown_source: AtomicU64,
    pub samples_late: AtomicU64,
    pub samples_overflow: AtomicU64,
    pub windows_closed: AtomicU64,
    pub rollups_complete: AtomicU64,
    pub rollups_timed_out: AtomicU64,
    pub rollups_drained: AtomicU64,
    pub late_corrections: AtomicU64,
    pub batches_persisted: AtomicU64,
    pub persistence_failures: AtomicU64,
}

/// Point-in-time copy of `EngineStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub samples_ingested: u64,
    pub samples_malformed: u64,
    pub samples_unknown_source: u64,
    pub samples_late: u64,
    pub samples_overflow: u64,
    pub windows_closed: u64,
    pub rollups_complete: u64,
    pub rollups_timed_out: u64,
    pub rollups_drained: u64,
    pub late_corrections: u64,
    pub batches_persisted: u64,
    pub persistence_failures: u64,
}

impl StatsSnapshot {
    pub fn samples_rejected(&self) -> u64 {
        self.samples_malformed
            + self.samples_unknown_source
            + self.samples_late
            + self.samples_overflow
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a rejected sample under its error kind
    pub fn record_rejection(&self, err: &EngineError) {
        let counter = match err {
            EngineError::MalformedSample { .. } => &self.samples_malformed,
            EngineError::UnknownSource(_) => &self.samples_unknown_source,
            EngineError::LateWindowDiscarded { .. } => &self.samples_late,
            EngineError::AccumulatorOverflow { .. } => &self.samples_overflow,
            _ => return,
        };
        Self::incr(counter);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            samples_ingested: load(&self.samples_ingested),
            samples_malformed: load(&self.samples_malformed),
            samples_unknown_source: load(&self.samples_unknown_source),
            samples_late: load(&self.samples_late),
            samples_overflow: load(&self.samples_overflow),
            windows_closed: load(&self.windows_closed),
            rollups_complete: load(&self.rollups_complete),
            rollups_timed_out: load(&self.rollups_timed_out),
            rollups_drained: load(&self.rollups_drained),
            late_corrections: load(&self.late_corrections),
            batches_persisted: load(&self.batches_persisted),
            persistence_failures: load(&self.persistence_failures),
        }
    }
}

/// Row for the `engine_events` table
///
/// Severity follows the 1-5 scale of the events table (1 informational, 5 critical).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineEvent {
    pub time_ms: i64,
    pub source_id: Option<String>,
    pub event_type: String,
    pub severity: i32,
    pub message: String,
    pub details_json: Option<String>,
}

impl EngineEvent {
    pub const ROLLUP_TIMEOUT: &'static str = "ROLLUP_TIMEOUT";
    pub const LATE_CORRECTION: &'static str = "LATE_CORRECTION";
    pub const PERSISTENCE_FAILURE: &'static str = "PERSISTENCE_FAILURE";

    pub fn new(time_ms: i64, event_type: &str, severity: i32, message: impl Into<String>) -> Self {
        Self {
            time_ms,
            source_id: None,
            event_type: event_type.to_string(),
            severity,
            message: message.into(),
            details_json: None,
        }
    }

    pub fn for_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details_json = Some(details.to_string());
        self
    }

    /// Event for a rollup forced after the grace period
    pub fn rollup_timeout(time_ms: i64, err: &EngineError, missing: &[String]) -> Self {
        let details = match err {
            EngineError::IncompleteRollupTimeout {
                window_start,
                active_sources,
                known_sources,
            } => serde_json::json!({
                "window_start": window_start,
                "active_sources": active_sources,
                "known_sources": known_sources,
                "missing_sources": missing,
            }),
            _ => serde_json::json!({ "missing_sources": missing }),
        };
        Self::new(time_ms, Self::ROLLUP_TIMEOUT, 3, err.to_string()).with_details(details)
    }

    pub fn late_correction(time_ms: i64, source_id: &str, window_start: i64) -> Self {
        Self::new(
            time_ms,
            Self::LATE_CORRECTION,
            2,
            format!("late aggregate for window {} re-flushed without system rollup", window_start),
        )
        .for_source(source_id)
        .with_details(serde_json::json!({ "window_start": window_start }))
    }

    pub fn persistence_failure(time_ms: i64, window_start: i64, attempt: u32, error: &str) -> Self {
        Self::new(
            time_ms,
            Self::PERSISTENCE_FAILURE,
            4,
            format!("write of window {} failed: {}", window_start, error),
        )
        .with_details(serde_json::json!({ "window_start": window_start, "attempt": attempt }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_counted_by_kind() {
        let stats = EngineStats::new();
        stats.record_rejection(&EngineError::UnknownSource("X".to_string()));
        stats.record_rejection(&EngineError::MalformedSample {
            source_id: "A".to_string(),
            reason: "nan".to_string(),
        });
        stats.record_rejection(&EngineError::InvalidState("ignored".to_string()));

        let snap = stats.snapshot();
        assert_eq!(snap.samples_unknown_source, 1);
        assert_eq!(snap.samples_malformed, 1);
        assert_eq!(snap.samples_rejected(), 2);
    }

    #[test]
    fn test_rollup_timeout_event_details() {
        let err = EngineError::IncompleteRollupTimeout {
            window_start: 100,
            active_sources: 1,
            known_sources: 2,
        };
        let event = EngineEvent::rollup_timeout(5_000, &err, &["B".to_string()]);

        assert_eq!(event.event_type, EngineEvent::ROLLUP_TIMEOUT);
        let details: serde_json::Value =
            serde_json::from_str(event.details_json.as_deref().unwrap()).unwrap();
        assert_eq!(details["known_sources"], 2);
        assert_eq!(details["missing_sources"][0], "B");
    }
}
