//! # Windowed Aggregation Pipeline
//!
//! Turns a stream of raw electrical telemetry samples into durable,
//! fixed-window statistics without ever storing raw samples.
//!
//! ## Architecture: Aggregate-Only Storage
//!
//! **Key Principle:** Raw samples are NEVER persisted.
//!
//! 1. Samples arrive per source at irregular, sub-second cadence
//! 2. Each source's open window keeps O(1) running statistics
//! 3. On a window boundary the window closes into a `SourceAggregate`
//! 4. Once every registered source closed the same window, a
//!    `SystemAggregate` is computed and both are upserted to SQLite
//! 5. 5-minute, hourly and daily rollups are views over the base tables,
//!    per source and system-wide
//!
//! Base tables keep everything forever (deletes abort); compression of old
//! chunks is declared once in `storage_policies`.
//!
//! ## Schema Reference
//!
//! All persisted types match the SQL in `/sql/`:
//! - `source_aggregates` → `SourceAggregate`
//! - `system_aggregates` → `SystemAggregate`
//! - `source_aggregates_{5min,1hour,daily}` → `RollupRow`
//! - `system_aggregates_{5min,1hour,daily}` → `SystemRollupRow`
//! - `engine_events` → `EngineEvent`
//! - `storage_policies` → `StoragePolicy`
//!
//! ## Module Organization
//!
//! - `types` - Samples, aggregates, alert kinds
//! - `error` - Engine and storage error taxonomy
//! - `windows` - Window boundary detection (`WindowClock`)
//! - `accumulator` - Running statistics (`WindowAccumulator`)
//! - `rollup` - Cross-source totals (`SystemRollupComputer`)
//! - `engine` - Orchestration (`AggregationEngine`)
//! - `stats` - Counters and engine events
//! - `db` - Persistence sink, schema loader, read contract
//! - `retry` - Exponential backoff
//! - `ingestion` - Async ingestion loop and persistence worker
//! - `config` - Environment configuration

pub mod types;
pub mod error;
pub mod windows;
pub mod accumulator;
pub mod rollup;
pub mod engine;
pub mod stats;
pub mod db;
pub mod retry;
pub mod ingestion;
pub mod config;

// Re-export commonly used types
pub use types::{
    AlertFlags, AlertKind, FlushBatch, Granularity, MetricSummary, RollupCompletion, RollupRow,
    Sample, SourceAggregate, SourceInfo, SystemAggregate, SystemRollupRow, TemperatureSummary,
    UnknownLabel,
};
pub use error::{EngineError, StorageError};
pub use windows::WindowClock;
pub use accumulator::WindowAccumulator;
pub use rollup::SystemRollupComputer;
pub use engine::{AggregationEngine, EngineSettings};
pub use stats::{EngineEvent, EngineStats, StatsSnapshot};
pub use db::{AggregateDbWriter, SqliteAggregateStore, StoragePolicy};
pub use ingestion::{spawn_pipeline, PersistenceReport, PipelineHandle, PipelineOptions};
pub use config::{ConfigError, PipelineConfig};
