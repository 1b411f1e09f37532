//! Core data types for the aggregation pipeline
//!
//! Raw `Sample`s flow in, `SourceAggregate`/`SystemAggregate` rows flow out.
//! Window starts are unix seconds floored to the configured window length;
//! sample timestamps are unix milliseconds.

use super::error::EngineError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// A stored or configured label that names no known variant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} label '{label}'")]
pub struct UnknownLabel {
    pub kind: &'static str,
    pub label: String,
}

/// Alert conditions reported by an INA228-class power monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TemperatureOverLimit,
    ShuntOverVoltage,
    ShuntUnderVoltage,
    BusOverVoltage,
    BusUnderVoltage,
    PowerOverLimit,
    MathOverflow,
    EnergyOverflow,
    ChargeOverflow,
}

impl AlertKind {
    pub const ALL: [AlertKind; 9] = [
        AlertKind::TemperatureOverLimit,
        AlertKind::ShuntOverVoltage,
        AlertKind::ShuntUnderVoltage,
        AlertKind::BusOverVoltage,
        AlertKind::BusUnderVoltage,
        AlertKind::PowerOverLimit,
        AlertKind::MathOverflow,
        AlertKind::EnergyOverflow,
        AlertKind::ChargeOverflow,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::TemperatureOverLimit => "temperature_over_limit",
            AlertKind::ShuntOverVoltage => "shunt_over_voltage",
            AlertKind::ShuntUnderVoltage => "shunt_under_voltage",
            AlertKind::BusOverVoltage => "bus_over_voltage",
            AlertKind::BusUnderVoltage => "bus_under_voltage",
            AlertKind::PowerOverLimit => "power_over_limit",
            AlertKind::MathOverflow => "math_overflow",
            AlertKind::EnergyOverflow => "energy_overflow",
            AlertKind::ChargeOverflow => "charge_overflow",
        }
    }
}

/// Fixed set of active alert kinds (membership only, no payload)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<AlertKind>", into = "Vec<AlertKind>")]
pub struct AlertFlags(u16);

impl AlertFlags {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, kind: AlertKind) -> Self {
        self.insert(kind);
        self
    }

    pub fn insert(&mut self, kind: AlertKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(&self, kind: AlertKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// True when at least one alert is raised
    pub fn is_active(&self) -> bool {
        self.0 != 0
    }

    pub fn union(self, other: AlertFlags) -> AlertFlags {
        AlertFlags(self.0 | other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = AlertKind> + '_ {
        AlertKind::ALL.into_iter().filter(|k| self.contains(*k))
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl From<Vec<AlertKind>> for AlertFlags {
    fn from(kinds: Vec<AlertKind>) -> Self {
        kinds
            .into_iter()
            .fold(AlertFlags::empty(), |flags, kind| flags.with(kind))
    }
}

impl From<AlertFlags> for Vec<AlertKind> {
    fn from(flags: AlertFlags) -> Self {
        flags.iter().collect()
    }
}

/// A single raw reading from one source
///
/// Immutable once created. Optional fields default when absent from a JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub source_id: String,
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Monotonic energy counter reading (device units)
    #[serde(default)]
    pub energy_cumulative: Option<f64>,
    #[serde(default)]
    pub alert_flags: AlertFlags,
    /// Point-in-time conditions label (e.g. "Full Sun", "Overcast")
    #[serde(default)]
    pub conditions: Option<String>,
}

impl Sample {
    pub fn new(
        source_id: impl Into<String>,
        timestamp_ms: i64,
        voltage: f64,
        current: f64,
        power: f64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp_ms,
            voltage,
            current,
            power,
            temperature: None,
            energy_cumulative: None,
            alert_flags: AlertFlags::empty(),
            conditions: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_energy(mut self, energy_cumulative: f64) -> Self {
        self.energy_cumulative = Some(energy_cumulative);
        self
    }

    pub fn with_alerts(mut self, alert_flags: AlertFlags) -> Self {
        self.alert_flags = alert_flags;
        self
    }

    pub fn with_conditions(mut self, conditions: impl Into<String>) -> Self {
        self.conditions = Some(conditions.into());
        self
    }

    /// Reject samples that cannot be aggregated
    pub fn validate(&self) -> Result<(), EngineError> {
        let reject = |reason: &str| EngineError::MalformedSample {
            source_id: self.source_id.clone(),
            reason: reason.to_string(),
        };

        if self.source_id.trim().is_empty() {
            return Err(reject("empty source_id"));
        }
        if self.timestamp_ms < 0 {
            return Err(reject("negative timestamp"));
        }
        if !self.voltage.is_finite() {
            return Err(reject("non-finite voltage"));
        }
        if !self.current.is_finite() {
            return Err(reject("non-finite current"));
        }
        if !self.power.is_finite() {
            return Err(reject("non-finite power"));
        }
        if matches!(self.temperature, Some(t) if !t.is_finite()) {
            return Err(reject("non-finite temperature"));
        }
        if matches!(self.energy_cumulative, Some(e) if !e.is_finite()) {
            return Err(reject("non-finite energy counter"));
        }
        Ok(())
    }
}

/// Registered telemetry source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub source_id: String,
    /// Nameplate power in watts, used for efficiency
    pub rated_power: f64,
}

impl SourceInfo {
    pub fn new(source_id: impl Into<String>, rated_power: f64) -> Self {
        Self {
            source_id: source_id.into(),
            rated_power,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.source_id.trim().is_empty() {
            return Err(EngineError::InvalidSource {
                source_id: self.source_id.clone(),
                reason: "empty source_id".to_string(),
            });
        }
        if !self.rated_power.is_finite() || self.rated_power <= 0.0 {
            return Err(EngineError::InvalidSource {
                source_id: self.source_id.clone(),
                reason: format!("rated_power must be positive, got {}", self.rated_power),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Samples in the window that carried a temperature
    pub sample_count: u64,
}

/// Closed statistics for one source over one window (`source_aggregates` row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAggregate {
    pub window_start: i64,
    pub source_id: String,
    pub window_length_secs: i64,
    pub sample_count: u64,
    pub voltage: MetricSummary,
    pub current: MetricSummary,
    /// `power.max` is the window's power peak
    pub power: MetricSummary,
    pub temperature: Option<TemperatureSummary>,
    pub energy_delta_wh: f64,
    /// Last counter reading seen in the window (not averaged)
    pub energy_cumulative: Option<f64>,
    pub rated_power: f64,
    pub efficiency_percent: f64,
    pub alert_count: u64,
    pub alert_kinds: AlertFlags,
    pub conditions: Option<String>,
    pub first_sample_ms: i64,
    pub last_sample_ms: i64,
}

/// How a system rollup was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupCompletion {
    /// Every registered source reported for the window
    Complete,
    /// Forced after the grace period with the sources present
    TimedOut,
    /// Forced by `flush_all` at shutdown
    Drained,
}

impl RollupCompletion {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollupCompletion::Complete => "complete",
            RollupCompletion::TimedOut => "timed_out",
            RollupCompletion::Drained => "drained",
        }
    }

}

impl FromStr for RollupCompletion {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(RollupCompletion::Complete),
            "timed_out" => Ok(RollupCompletion::TimedOut),
            "drained" => Ok(RollupCompletion::Drained),
            _ => Err(UnknownLabel {
                kind: "completion",
                label: s.to_string(),
            }),
        }
    }
}

/// Cross-source totals for one window (`system_aggregates` row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAggregate {
    pub window_start: i64,
    pub total_power_mean: f64,
    /// Σ per-source power maxima: an upper bound, not the coincident peak
    pub total_power_peak: f64,
    pub total_current_mean: f64,
    pub total_energy_wh: f64,
    pub system_voltage_mean: f64,
    pub system_efficiency_percent: f64,
    pub active_source_count: usize,
    pub total_known_sources: usize,
    pub best_source_id: String,
    pub worst_source_id: String,
    pub best_source_power: f64,
    pub worst_source_power: f64,
    pub total_alerts: u64,
    pub completion: RollupCompletion,
}

impl SystemAggregate {
    /// Fewer sources reported than are known
    pub fn is_partial(&self) -> bool {
        self.active_source_count < self.total_known_sources
    }
}

/// Rows ready for the sink, grouped by window
///
/// `system` is `None` for a late corrective re-flush of a window whose system row
/// was already written.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushBatch {
    pub window_start: i64,
    pub sources: Vec<SourceAggregate>,
    pub system: Option<SystemAggregate>,
}

/// Coarser read resolutions served by the rollup views
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    FiveMinutes,
    Hourly,
    Daily,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::FiveMinutes => "5m",
            Granularity::Hourly => "1h",
            Granularity::Daily => "1d",
        }
    }

    pub fn bucket_secs(&self) -> i64 {
        match self {
            Granularity::FiveMinutes => 5 * 60,
            Granularity::Hourly => 60 * 60,
            Granularity::Daily => 24 * 60 * 60,
        }
    }

    /// Per-source rollup view
    pub fn view_name(&self) -> &'static str {
        match self {
            Granularity::FiveMinutes => "source_aggregates_5min",
            Granularity::Hourly => "source_aggregates_1hour",
            Granularity::Daily => "source_aggregates_daily",
        }
    }

    /// System-wide rollup view
    pub fn system_view_name(&self) -> &'static str {
        match self {
            Granularity::FiveMinutes => "system_aggregates_5min",
            Granularity::Hourly => "system_aggregates_1hour",
            Granularity::Daily => "system_aggregates_daily",
        }
    }

    pub fn all() -> [Granularity; 3] {
        [Granularity::FiveMinutes, Granularity::Hourly, Granularity::Daily]
    }
}

impl FromStr for Granularity {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "5m" => Ok(Granularity::FiveMinutes),
            "1h" => Ok(Granularity::Hourly),
            "1d" => Ok(Granularity::Daily),
            _ => Err(UnknownLabel {
                kind: "granularity",
                label: s.to_string(),
            }),
        }
    }
}

/// One bucket of a rollup view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupRow {
    pub bucket_start: i64,
    pub source_id: String,
    pub window_count: u64,
    pub sample_count: u64,
    pub voltage_mean: f64,
    pub voltage_min: f64,
    pub voltage_max: f64,
    pub current_mean: f64,
    pub current_min: f64,
    pub current_max: f64,
    pub power_mean: f64,
    pub power_min: f64,
    pub power_peak: f64,
    pub energy_wh: f64,
    pub temperature_mean: Option<f64>,
    pub alert_count: u64,
    pub efficiency_percent: f64,
}

/// One bucket of a system rollup view
///
/// Power and efficiency are means over the bucket's windows; energy and alerts
/// are sums; `max_active_sources` is the most sources seen in any one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemRollupRow {
    pub bucket_start: i64,
    pub window_count: u64,
    pub total_power_mean: f64,
    pub total_power_peak: f64,
    pub total_energy_wh: f64,
    pub system_voltage_mean: f64,
    pub system_efficiency_percent: f64,
    pub max_active_sources: usize,
    pub total_alerts: u64,
    /// Windows rolled up with fewer sources than were known
    pub partial_windows: u64,
}
