//! Window boundary detection
//!
//! `WindowClock` floors each sample timestamp to its window start and tracks the
//! currently open window per source. It is pure local state: no I/O, no suspension.

use super::error::EngineError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Longest supported window; the daily rollup view assumes windows nest in a day
pub const MAX_WINDOW_LENGTH_SECS: i64 = 86_400;

/// Result of classifying one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssignment {
    /// Window the sample is aggregated into (unix seconds)
    pub window_start: i64,
    /// The source moved to a window it has not seen yet
    pub is_new_window: bool,
    /// Window that must be closed because of this transition
    pub previous_window: Option<i64>,
    /// The sample belonged to an earlier window and was folded into the open one
    pub folded_late: bool,
}

/// Maps sample timestamps to windows and detects per-source boundary crossings
#[derive(Debug, Clone)]
pub struct WindowClock {
    window_length_secs: i64,
    open: HashMap<String, i64>,
}

impl WindowClock {
    /// Window length is clamped to `1..=MAX_WINDOW_LENGTH_SECS`
    pub fn new(window_length_secs: i64) -> Self {
        Self {
            window_length_secs: window_length_secs.clamp(1, MAX_WINDOW_LENGTH_SECS),
            open: HashMap::new(),
        }
    }

    /// Floor a millisecond timestamp to its window start in seconds
    pub fn window_start_for(&self, timestamp_ms: i64) -> i64 {
        let length_ms = self.window_length_secs * 1000;
        timestamp_ms.div_euclid(length_ms) * self.window_length_secs
    }

    /// Currently open window for a source, if any
    pub fn open_window(&self, source_id: &str) -> Option<i64> {
        self.open.get(source_id).copied()
    }

    /// Classify a sample and advance the source's open window
    ///
    /// A sample for the window immediately before the open one is folded into the
    /// open window. Anything older is rejected with `LateWindowDiscarded` and
    /// leaves the clock untouched.
    pub fn classify(
        &mut self,
        source_id: &str,
        timestamp_ms: i64,
    ) -> Result<WindowAssignment, EngineError> {
        let computed = self.window_start_for(timestamp_ms);

        match self.open.get(source_id).copied() {
            None => {
                self.open.insert(source_id.to_string(), computed);
                Ok(WindowAssignment {
                    window_start: computed,
                    is_new_window: true,
                    previous_window: None,
                    folded_late: false,
                })
            }
            Some(open) if computed == open => Ok(WindowAssignment {
                window_start: open,
                is_new_window: false,
                previous_window: None,
                folded_late: false,
            }),
            Some(open) if computed > open => {
                self.open.insert(source_id.to_string(), computed);
                Ok(WindowAssignment {
                    window_start: computed,
                    is_new_window: true,
                    previous_window: Some(open),
                    folded_late: false,
                })
            }
            Some(open) if computed >= open - self.window_length_secs => Ok(WindowAssignment {
                window_start: open,
                is_new_window: false,
                previous_window: None,
                folded_late: true,
            }),
            Some(open) => Err(EngineError::LateWindowDiscarded {
                source_id: source_id.to_string(),
                window_start: computed,
                open_window_start: open,
            }),
        }
    }

    /// Restore a source's open window after a transition that could not be applied
    pub fn rewind(&mut self, source_id: &str, previous: Option<i64>) {
        match previous {
            Some(window_start) => {
                self.open.insert(source_id.to_string(), window_start);
            }
            None => {
                self.open.remove(source_id);
            }
        }
    }

    /// Forget a source's open window
    pub fn forget(&mut self, source_id: &str) -> Option<i64> {
        self.open.remove(source_id)
    }
}

/// Render a window start as RFC 3339 for logs and event details
pub fn format_window_start(window_start: i64) -> String {
    DateTime::<Utc>::from_timestamp(window_start, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| window_start.to_string())
}
