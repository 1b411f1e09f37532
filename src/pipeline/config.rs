//! Pipeline configuration from environment variables

use super::engine::EngineSettings;
use super::types::SourceInfo;
use super::windows::MAX_WINDOW_LENGTH_SECS;
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Configuration for the pipeline runtime
///
/// Loaded from environment variables with defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the ordered `.sql` schema files
    pub schema_dir: String,

    /// Base window length in seconds
    pub window_length_secs: i64,

    /// Channel buffer size for sample ingestion
    pub channel_buffer: usize,

    /// Number of accumulator shards
    pub engine_shards: usize,

    pub rollup_grace_period_ms: u64,
    pub rollup_sweep_interval_ms: u64,

    /// Declared compression horizon for base tables
    pub compression_after_days: u32,

    pub persist_retry_initial_ms: u64,
    pub persist_retry_max_ms: u64,

    /// Attempts per batch once retries are torn down
    pub final_flush_attempts: u32,

    pub shutdown_drain_timeout_ms: u64,

    /// Rated power applied to sources listed without one
    pub default_rated_power_w: f64,

    /// Sources registered at startup
    pub sources: Vec<SourceInfo>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "data/panelflow.db".to_string(),
            schema_dir: "sql".to_string(),
            window_length_secs: 1,
            channel_buffer: 10_000,
            engine_shards: 8,
            rollup_grace_period_ms: 5_000,
            rollup_sweep_interval_ms: 1_000,
            compression_after_days: 7,
            persist_retry_initial_ms: 250,
            persist_retry_max_ms: 30_000,
            final_flush_attempts: 3,
            shutdown_drain_timeout_ms: 10_000,
            default_rated_power_w: 100.0,
            sources: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PANELFLOW_DB_PATH` (default: data/panelflow.db)
    /// - `PANELFLOW_SCHEMA_DIR` (default: sql)
    /// - `WINDOW_LENGTH_SECS` (default: 1, at most 86400)
    /// - `SAMPLE_CHANNEL_BUFFER` (default: 10000)
    /// - `ENGINE_SHARDS` (default: 8)
    /// - `ROLLUP_GRACE_PERIOD_MS` (default: 5000)
    /// - `ROLLUP_SWEEP_INTERVAL_MS` (default: 1000)
    /// - `COMPRESSION_AFTER_DAYS` (default: 7)
    /// - `PERSIST_RETRY_INITIAL_MS` (default: 250)
    /// - `PERSIST_RETRY_MAX_MS` (default: 30000)
    /// - `FINAL_FLUSH_ATTEMPTS` (default: 3)
    /// - `SHUTDOWN_DRAIN_TIMEOUT_MS` (default: 10000)
    /// - `DEFAULT_RATED_POWER_W` (default: 100)
    /// - `PANELFLOW_SOURCES` (default: empty), e.g. `PS100_01:100,PS100_02`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let default_rated_power_w =
            parse_or(&lookup, "DEFAULT_RATED_POWER_W", defaults.default_rated_power_w)?;
        if !default_rated_power_w.is_finite() || default_rated_power_w <= 0.0 {
            return Err(invalid(
                "DEFAULT_RATED_POWER_W",
                &default_rated_power_w.to_string(),
                "must be positive",
            ));
        }

        let sources = match lookup("PANELFLOW_SOURCES") {
            Some(raw) => parse_sources(&raw, default_rated_power_w)?,
            None => Vec::new(),
        };

        let config = Self {
            db_path: lookup("PANELFLOW_DB_PATH").unwrap_or(defaults.db_path),
            schema_dir: lookup("PANELFLOW_SCHEMA_DIR").unwrap_or(defaults.schema_dir),
            window_length_secs: parse_or(
                &lookup,
                "WINDOW_LENGTH_SECS",
                defaults.window_length_secs,
            )?,
            channel_buffer: parse_or(&lookup, "SAMPLE_CHANNEL_BUFFER", defaults.channel_buffer)?,
            engine_shards: parse_or(&lookup, "ENGINE_SHARDS", defaults.engine_shards)?,
            rollup_grace_period_ms: parse_or(
                &lookup,
                "ROLLUP_GRACE_PERIOD_MS",
                defaults.rollup_grace_period_ms,
            )?,
            rollup_sweep_interval_ms: parse_or(
                &lookup,
                "ROLLUP_SWEEP_INTERVAL_MS",
                defaults.rollup_sweep_interval_ms,
            )?,
            compression_after_days: parse_or(
                &lookup,
                "COMPRESSION_AFTER_DAYS",
                defaults.compression_after_days,
            )?,
            persist_retry_initial_ms: parse_or(
                &lookup,
                "PERSIST_RETRY_INITIAL_MS",
                defaults.persist_retry_initial_ms,
            )?,
            persist_retry_max_ms: parse_or(
                &lookup,
                "PERSIST_RETRY_MAX_MS",
                defaults.persist_retry_max_ms,
            )?,
            final_flush_attempts: parse_or(
                &lookup,
                "FINAL_FLUSH_ATTEMPTS",
                defaults.final_flush_attempts,
            )?,
            shutdown_drain_timeout_ms: parse_or(
                &lookup,
                "SHUTDOWN_DRAIN_TIMEOUT_MS",
                defaults.shutdown_drain_timeout_ms,
            )?,
            default_rated_power_w,
            sources,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_WINDOW_LENGTH_SECS).contains(&self.window_length_secs) {
            return Err(invalid(
                "WINDOW_LENGTH_SECS",
                &self.window_length_secs.to_string(),
                &format!("must be between 1 and {}", MAX_WINDOW_LENGTH_SECS),
            ));
        }
        if self.channel_buffer == 0 {
            return Err(invalid("SAMPLE_CHANNEL_BUFFER", "0", "must be >= 1"));
        }
        if self.engine_shards == 0 {
            return Err(invalid("ENGINE_SHARDS", "0", "must be >= 1"));
        }
        if self.rollup_sweep_interval_ms == 0 {
            return Err(invalid("ROLLUP_SWEEP_INTERVAL_MS", "0", "must be >= 1"));
        }
        if self.final_flush_attempts == 0 {
            return Err(invalid("FINAL_FLUSH_ATTEMPTS", "0", "must be >= 1"));
        }
        if self.persist_retry_max_ms < self.persist_retry_initial_ms {
            return Err(invalid(
                "PERSIST_RETRY_MAX_MS",
                &self.persist_retry_max_ms.to_string(),
                "must be >= PERSIST_RETRY_INITIAL_MS",
            ));
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            window_length_secs: self.window_length_secs,
            shard_count: self.engine_shards,
            grace_period_ms: i64::try_from(self.rollup_grace_period_ms).unwrap_or(i64::MAX),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.rollup_sweep_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
        None => Ok(default),
    }
}

/// Parse `id[:rated_w]` entries separated by commas
fn parse_sources(raw: &str, default_rated_power_w: f64) -> Result<Vec<SourceInfo>, ConfigError> {
    let mut sources: Vec<SourceInfo> = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, rated) = match entry.split_once(':') {
            Some((id, rated)) => {
                let rated: f64 = rated
                    .trim()
                    .parse()
                    .map_err(|_| {
                        invalid("PANELFLOW_SOURCES", entry, "rated power is not a number")
                    })?;
                (id.trim(), rated)
            }
            None => (entry, default_rated_power_w),
        };

        let info = SourceInfo::new(id, rated);
        info.validate()
            .map_err(|e| invalid("PANELFLOW_SOURCES", entry, &e.to_string()))?;
        if sources.iter().any(|s| s.source_id == info.source_id) {
            return Err(invalid("PANELFLOW_SOURCES", entry, "duplicate source id"));
        }
        sources.push(info);
    }

    Ok(sources)
}
