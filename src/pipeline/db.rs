//! Time-series store for windowed aggregates
//!
//! Writes go through `AggregateDbWriter` (idempotent upserts keyed by
//! `(window_start, source_id)` and `(window_start)`). Reads serve the
//! presentation layer directly from the base tables and the rollup views in
//! `/sql/03_rollup_views.sql`.

use super::error::StorageError;
use super::stats::EngineEvent;
use super::types::{
    AlertFlags, FlushBatch, Granularity, MetricSummary, RollupCompletion, RollupRow,
    SourceAggregate, SystemAggregate, SystemRollupRow, TemperatureSummary,
};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Tables covered by the declared storage policies
const POLICY_TABLES: [&str; 2] = ["source_aggregates", "system_aggregates"];

/// Trait for persisting aggregates and engine events
///
/// Tables written (see `/sql/` directory):
/// - `source_aggregates` - UPSERT on (window_start, source_id)
/// - `system_aggregates` - UPSERT on window_start
/// - `engine_events` - INSERT (append-only)
#[async_trait]
pub trait AggregateDbWriter: Send + Sync {
    /// Replace or insert one per-source row
    async fn upsert_source_aggregate(
        &self,
        aggregate: &SourceAggregate,
    ) -> Result<(), StorageError>;

    /// Replace or insert one system row
    async fn upsert_system_aggregate(
        &self,
        aggregate: &SystemAggregate,
    ) -> Result<(), StorageError>;

    /// Write a whole window: source rows first, then the system row
    async fn write_flush_batch(&self, batch: &FlushBatch) -> Result<(), StorageError> {
        for aggregate in &batch.sources {
            self.upsert_source_aggregate(aggregate).await?;
        }
        if let Some(system) = &batch.system {
            self.upsert_system_aggregate(system).await?;
        }
        Ok(())
    }

    async fn record_event(&self, event: &EngineEvent) -> Result<(), StorageError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files in `schema_dir`, sorted by name, and executes them.
/// Every file uses `IF NOT EXISTS`, so rerunning is a no-op.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StorageError> {
    let schema_path = Path::new(schema_dir);
    if !schema_path.is_dir() {
        return Err(StorageError::SchemaNotFound(schema_dir.to_string()));
    }

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();
    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();
        log::info!("   ├─ Executing: {}", filename);

        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;

        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// Declare compression and retention once per table
///
/// Existing declarations are left untouched; a differing configured horizon
/// is logged and ignored.
pub fn declare_storage_policies(
    conn: &Connection,
    compression_after_days: u32,
    now_ms: i64,
) -> Result<(), StorageError> {
    let compress_after = format!("{} days", compression_after_days);

    for table in POLICY_TABLES {
        conn.execute(
            "INSERT OR IGNORE INTO storage_policies (table_name, policy, value, declared_at_ms)
             VALUES (?1, 'retention', 'none', ?2)",
            params![table, now_ms],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO storage_policies (table_name, policy, value, declared_at_ms)
             VALUES (?1, 'compress_after', ?2, ?3)",
            params![table, compress_after, now_ms],
        )?;

        let declared: Option<String> = conn
            .query_row(
                "SELECT value FROM storage_policies
                 WHERE table_name = ?1 AND policy = 'compress_after'",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        if declared.as_deref() != Some(compress_after.as_str()) {
            log::warn!(
                "⚠️  {} already declares compress_after={:?}, configured {} ignored",
                table,
                declared,
                compress_after
            );
        }
    }

    Ok(())
}

/// One declared storage policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoragePolicy {
    pub table_name: String,
    pub policy: String,
    pub value: String,
}

/// SQLite implementation of `AggregateDbWriter` plus the read contract
#[derive(Clone)]
pub struct SqliteAggregateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAggregateStore {
    /// Open (or create) the store, apply pragmas, run migrations and declare
    /// storage policies
    pub fn open(
        db_path: &str,
        schema_dir: &str,
        compression_after_days: u32,
    ) -> Result<Self, StorageError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(db_path)?;
        let journal_mode = apply_optimized_pragmas(&conn)?;
        log::info!("📊 Opened store {} (journal_mode={})", db_path, journal_mode);

        run_schema_migrations(&mut conn, schema_dir)?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        declare_storage_policies(&conn, compression_after_days, now_ms)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("connection lock poisoned".to_string()))
    }

    /// Per-source rows with `window_start >= since`, oldest first
    pub fn recent(
        &self,
        source_id: Option<&str>,
        since: i64,
    ) -> Result<Vec<SourceAggregate>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM source_aggregates
             WHERE window_start >= ?1 AND (?2 IS NULL OR source_id = ?2)
             ORDER BY window_start, source_id",
            SOURCE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![since, source_id], source_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rollup buckets from the view for `granularity`
    ///
    /// `since` is floored to its bucket so the bucket containing it is included.
    pub fn rollup(
        &self,
        source_id: Option<&str>,
        granularity: Granularity,
        since: i64,
    ) -> Result<Vec<RollupRow>, StorageError> {
        let bucket_floor = since.div_euclid(granularity.bucket_secs()) * granularity.bucket_secs();
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT bucket_start, source_id, window_count, sample_count,
                    voltage_mean, voltage_min, voltage_max,
                    current_mean, current_min, current_max,
                    power_mean, power_min, power_peak,
                    energy_wh, temperature_mean, alert_count, efficiency_percent
             FROM {}
             WHERE bucket_start >= ?1 AND (?2 IS NULL OR source_id = ?2)
             ORDER BY bucket_start, source_id",
            granularity.view_name()
        ))?;

        let rows = stmt
            .query_map(params![bucket_floor, source_id], |row| {
                Ok(RollupRow {
                    bucket_start: row.get(0)?,
                    source_id: row.get(1)?,
                    window_count: row.get::<_, i64>(2)? as u64,
                    sample_count: row.get::<_, i64>(3)? as u64,
                    voltage_mean: row.get(4)?,
                    voltage_min: row.get(5)?,
                    voltage_max: row.get(6)?,
                    current_mean: row.get(7)?,
                    current_min: row.get(8)?,
                    current_max: row.get(9)?,
                    power_mean: row.get(10)?,
                    power_min: row.get(11)?,
                    power_peak: row.get(12)?,
                    energy_wh: row.get(13)?,
                    temperature_mean: row.get(14)?,
                    alert_count: row.get::<_, i64>(15)? as u64,
                    efficiency_percent: row.get(16)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// System-wide buckets from the view for `granularity`
    ///
    /// One row per bucket regardless of how many sources reported. `since` is
    /// floored to its bucket like `rollup`.
    pub fn rollup_system(
        &self,
        granularity: Granularity,
        since: i64,
    ) -> Result<Vec<SystemRollupRow>, StorageError> {
        let bucket_floor = since.div_euclid(granularity.bucket_secs()) * granularity.bucket_secs();
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT bucket_start, window_count, total_power_mean, total_power_peak, total_energy_wh,
                    system_voltage_mean, system_efficiency_percent, max_active_sources,
                    total_alerts, partial_windows
             FROM {}
             WHERE bucket_start >= ?1
             ORDER BY bucket_start",
            granularity.system_view_name()
        ))?;

        let rows = stmt
            .query_map([bucket_floor], |row| {
                Ok(SystemRollupRow {
                    bucket_start: row.get(0)?,
                    window_count: row.get::<_, i64>(1)? as u64,
                    total_power_mean: row.get(2)?,
                    total_power_peak: row.get(3)?,
                    total_energy_wh: row.get(4)?,
                    system_voltage_mean: row.get(5)?,
                    system_efficiency_percent: row.get(6)?,
                    max_active_sources: row.get::<_, i64>(7)? as usize,
                    total_alerts: row.get::<_, i64>(8)? as u64,
                    partial_windows: row.get::<_, i64>(9)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// System rows with `window_start >= since`, oldest first
    pub fn recent_system(&self, since: i64) -> Result<Vec<SystemAggregate>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM system_aggregates WHERE window_start >= ?1 ORDER BY window_start",
            SYSTEM_COLUMNS
        ))?;
        let rows = stmt
            .query_map([since], system_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn storage_policies(&self) -> Result<Vec<StoragePolicy>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT table_name, policy, value FROM storage_policies
             ORDER BY table_name, policy",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoragePolicy {
                    table_name: row.get(0)?,
                    policy: row.get(1)?,
                    value: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Events with `time_ms >= since_ms`, oldest first
    pub fn events_since(&self, since_ms: i64) -> Result<Vec<EngineEvent>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT time_ms, source_id, event_type, severity, message, details_json
             FROM engine_events WHERE time_ms >= ?1 ORDER BY time_ms, id",
        )?;
        let rows = stmt
            .query_map([since_ms], |row| {
                Ok(EngineEvent {
                    time_ms: row.get(0)?,
                    source_id: row.get(1)?,
                    event_type: row.get(2)?,
                    severity: row.get(3)?,
                    message: row.get(4)?,
                    details_json: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl AggregateDbWriter for SqliteAggregateStore {
    async fn upsert_source_aggregate(
        &self,
        aggregate: &SourceAggregate,
    ) -> Result<(), StorageError> {
        let conn = self.lock()?;
        upsert_source(&conn, aggregate)
    }

    async fn upsert_system_aggregate(
        &self,
        aggregate: &SystemAggregate,
    ) -> Result<(), StorageError> {
        let conn = self.lock()?;
        upsert_system(&conn, aggregate)
    }

    /// One transaction per window: either every row lands or none does
    async fn write_flush_batch(&self, batch: &FlushBatch) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for aggregate in &batch.sources {
            upsert_source(&tx, aggregate)?;
        }
        if let Some(system) = &batch.system {
            upsert_system(&tx, system)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn record_event(&self, event: &EngineEvent) -> Result<(), StorageError> {
        if let Some(json) = &event.details_json {
            serde_json::from_str::<serde_json::Value>(json)?;
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO engine_events
                (time_ms, source_id, event_type, severity, message, details_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.time_ms,
                event.source_id,
                event.event_type,
                event.severity,
                event.message,
                event.details_json,
            ],
        )?;
        Ok(())
    }
}

const SOURCE_COLUMNS: &str = "window_start, source_id, window_length_secs, sample_count,
    voltage_mean, voltage_min, voltage_max, voltage_stddev,
    current_mean, current_min, current_max, current_stddev,
    power_mean, power_min, power_max, power_stddev,
    temperature_mean, temperature_min, temperature_max,
    energy_delta_wh, energy_cumulative, rated_power, efficiency_percent,
    alert_count, alert_kinds, conditions, first_sample_ms, last_sample_ms,
    temperature_sample_count";

const SYSTEM_COLUMNS: &str = "window_start, total_power_mean, total_power_peak, total_current_mean,
    total_energy_wh, system_voltage_mean, system_efficiency_percent,
    active_source_count, total_known_sources,
    best_source_id, worst_source_id, best_source_power, worst_source_power,
    total_alerts, completion";

fn upsert_source(conn: &Connection, agg: &SourceAggregate) -> Result<(), StorageError> {
    let alert_kinds = serde_json::to_string(&agg.alert_kinds)?;
    let temperature = agg.temperature;

    conn.execute(
        &format!(
            "INSERT INTO source_aggregates ({})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)
             ON CONFLICT(window_start, source_id) DO UPDATE SET
                window_length_secs = excluded.window_length_secs,
                sample_count = excluded.sample_count,
                voltage_mean = excluded.voltage_mean,
                voltage_min = excluded.voltage_min,
                voltage_max = excluded.voltage_max,
                voltage_stddev = excluded.voltage_stddev,
                current_mean = excluded.current_mean,
                current_min = excluded.current_min,
                current_max = excluded.current_max,
                current_stddev = excluded.current_stddev,
                power_mean = excluded.power_mean,
                power_min = excluded.power_min,
                power_max = excluded.power_max,
                power_stddev = excluded.power_stddev,
                temperature_mean = excluded.temperature_mean,
                temperature_min = excluded.temperature_min,
                temperature_max = excluded.temperature_max,
                energy_delta_wh = excluded.energy_delta_wh,
                energy_cumulative = excluded.energy_cumulative,
                rated_power = excluded.rated_power,
                efficiency_percent = excluded.efficiency_percent,
                alert_count = excluded.alert_count,
                alert_kinds = excluded.alert_kinds,
                conditions = excluded.conditions,
                first_sample_ms = excluded.first_sample_ms,
                last_sample_ms = excluded.last_sample_ms,
                temperature_sample_count = excluded.temperature_sample_count",
            SOURCE_COLUMNS
        ),
        params![
            agg.window_start,
            agg.source_id,
            agg.window_length_secs,
            agg.sample_count as i64,
            agg.voltage.mean,
            agg.voltage.min,
            agg.voltage.max,
            agg.voltage.stddev,
            agg.current.mean,
            agg.current.min,
            agg.current.max,
            agg.current.stddev,
            agg.power.mean,
            agg.power.min,
            agg.power.max,
            agg.power.stddev,
            temperature.map(|t| t.mean),
            temperature.map(|t| t.min),
            temperature.map(|t| t.max),
            agg.energy_delta_wh,
            agg.energy_cumulative,
            agg.rated_power,
            agg.efficiency_percent,
            agg.alert_count as i64,
            alert_kinds,
            agg.conditions,
            agg.first_sample_ms,
            agg.last_sample_ms,
            temperature.map_or(0, |t| t.sample_count as i64),
        ],
    )?;
    Ok(())
}

fn upsert_system(conn: &Connection, agg: &SystemAggregate) -> Result<(), StorageError> {
    conn.execute(
        &format!(
            "INSERT INTO system_aggregates ({})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(window_start) DO UPDATE SET
                total_power_mean = excluded.total_power_mean,
                total_power_peak = excluded.total_power_peak,
                total_current_mean = excluded.total_current_mean,
                total_energy_wh = excluded.total_energy_wh,
                system_voltage_mean = excluded.system_voltage_mean,
                system_efficiency_percent = excluded.system_efficiency_percent,
                active_source_count = excluded.active_source_count,
                total_known_sources = excluded.total_known_sources,
                best_source_id = excluded.best_source_id,
                worst_source_id = excluded.worst_source_id,
                best_source_power = excluded.best_source_power,
                worst_source_power = excluded.worst_source_power,
                total_alerts = excluded.total_alerts,
                completion = excluded.completion",
            SYSTEM_COLUMNS
        ),
        params![
            agg.window_start,
            agg.total_power_mean,
            agg.total_power_peak,
            agg.total_current_mean,
            agg.total_energy_wh,
            agg.system_voltage_mean,
            agg.system_efficiency_percent,
            agg.active_source_count as i64,
            agg.total_known_sources as i64,
            agg.best_source_id,
            agg.worst_source_id,
            agg.best_source_power,
            agg.worst_source_power,
            agg.total_alerts as i64,
            agg.completion.as_str(),
        ],
    )?;
    Ok(())
}

fn conversion_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn metric(row: &Row, first: usize) -> rusqlite::Result<MetricSummary> {
    Ok(MetricSummary {
        mean: row.get(first)?,
        min: row.get(first + 1)?,
        max: row.get(first + 2)?,
        stddev: row.get(first + 3)?,
    })
}

fn source_from_row(row: &Row) -> rusqlite::Result<SourceAggregate> {
    let temperature = match (
        row.get::<_, Option<f64>>(16)?,
        row.get::<_, Option<f64>>(17)?,
        row.get::<_, Option<f64>>(18)?,
    ) {
        (Some(mean), Some(min), Some(max)) => Some(TemperatureSummary {
            mean,
            min,
            max,
            sample_count: row.get::<_, i64>(28)? as u64,
        }),
        _ => None,
    };
    let alert_kinds: String = row.get(24)?;
    let alert_kinds: AlertFlags =
        serde_json::from_str(&alert_kinds).map_err(|e| conversion_error(24, e))?;

    Ok(SourceAggregate {
        window_start: row.get(0)?,
        source_id: row.get(1)?,
        window_length_secs: row.get(2)?,
        sample_count: row.get::<_, i64>(3)? as u64,
        voltage: metric(row, 4)?,
        current: metric(row, 8)?,
        power: metric(row, 12)?,
        temperature,
        energy_delta_wh: row.get(19)?,
        energy_cumulative: row.get(20)?,
        rated_power: row.get(21)?,
        efficiency_percent: row.get(22)?,
        alert_count: row.get::<_, i64>(23)? as u64,
        alert_kinds,
        conditions: row.get(25)?,
        first_sample_ms: row.get(26)?,
        last_sample_ms: row.get(27)?,
    })
}

fn system_from_row(row: &Row) -> rusqlite::Result<SystemAggregate> {
    let completion: String = row.get(14)?;
    let completion = completion
        .parse::<RollupCompletion>()
        .map_err(|e| conversion_error(14, e))?;

    Ok(SystemAggregate {
        window_start: row.get(0)?,
        total_power_mean: row.get(1)?,
        total_power_peak: row.get(2)?,
        total_current_mean: row.get(3)?,
        total_energy_wh: row.get(4)?,
        system_voltage_mean: row.get(5)?,
        system_efficiency_percent: row.get(6)?,
        active_source_count: row.get::<_, i64>(7)? as usize,
        total_known_sources: row.get::<_, i64>(8)? as usize,
        best_source_id: row.get(9)?,
        worst_source_id: row.get(10)?,
        best_source_power: row.get(11)?,
        worst_source_power: row.get(12)?,
        total_alerts: row.get::<_, i64>(13)? as u64,
        completion,
    })
}
