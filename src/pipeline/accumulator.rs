//! Per-source, per-window running statistics
//!
//! Memory use is constant per window: only count, sum, sum of squares and
//! min/max are retained for each metric. The variance formula
//! `sum_sq / n - mean^2` loses precision for very long windows; at the
//! configured lengths (seconds) the error stays far below sensor resolution.

use super::error::EngineError;
use super::types::{AlertFlags, MetricSummary, Sample, SourceAggregate, TemperatureSummary};

#[derive(Debug, Clone, Copy)]
struct RunningMetric {
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl RunningMetric {
    fn seed(value: f64) -> Option<Self> {
        let seeded = Self {
            sum: value,
            sum_sq: value * value,
            min: value,
            max: value,
        };
        seeded.sum_sq.is_finite().then_some(seeded)
    }

    /// Returns `None` if the updated sums would not be finite
    fn push(&self, value: f64) -> Option<Self> {
        let next = Self {
            sum: self.sum + value,
            sum_sq: self.sum_sq + value * value,
            min: self.min.min(value),
            max: self.max.max(value),
        };
        (next.sum.is_finite() && next.sum_sq.is_finite()).then_some(next)
    }

    fn summarize(&self, count: u64) -> MetricSummary {
        let n = count as f64;
        let mean = self.sum / n;
        let variance = self.sum_sq / n - mean * mean;
        MetricSummary {
            mean,
            min: self.min,
            max: self.max,
            // Rounding can push variance slightly negative
            stddev: variance.max(0.0).sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunningTemperature {
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
}

impl RunningTemperature {
    fn seed(value: f64) -> Self {
        Self {
            sum: value,
            count: 1,
            min: value,
            max: value,
        }
    }

    fn push(&self, value: f64) -> Option<Self> {
        let next = Self {
            sum: self.sum + value,
            count: self.count.checked_add(1)?,
            min: self.min.min(value),
            max: self.max.max(value),
        };
        next.sum.is_finite().then_some(next)
    }

    fn summarize(&self) -> TemperatureSummary {
        TemperatureSummary {
            mean: self.sum / self.count as f64,
            min: self.min,
            max: self.max,
            sample_count: self.count,
        }
    }
}

#[derive(Debug, Clone)]
struct Running {
    count: u64,
    voltage: RunningMetric,
    current: RunningMetric,
    power: RunningMetric,
    temperature: Option<RunningTemperature>,
    last_energy_cumulative: Option<f64>,
    alert_count: u64,
    alert_kinds: AlertFlags,
    conditions: Option<String>,
    first_sample_ms: i64,
    last_sample_ms: i64,
}

/// Open window state for one source
///
/// Created from the window's first sample so `count >= 1` always holds.
/// `close` consumes the running state; any later `add` or `close` fails
/// with `InvalidState`.
#[derive(Debug, Clone)]
pub struct WindowAccumulator {
    source_id: String,
    window_start: i64,
    window_length_secs: i64,
    rated_power: f64,
    state: Option<Running>,
}

impl WindowAccumulator {
    pub fn open(
        first: &Sample,
        window_start: i64,
        window_length_secs: i64,
        rated_power: f64,
    ) -> Result<Self, EngineError> {
        let overflow = || EngineError::AccumulatorOverflow {
            source_id: first.source_id.clone(),
            window_start,
        };

        let state = Running {
            count: 1,
            voltage: RunningMetric::seed(first.voltage).ok_or_else(overflow)?,
            current: RunningMetric::seed(first.current).ok_or_else(overflow)?,
            power: RunningMetric::seed(first.power).ok_or_else(overflow)?,
            temperature: first.temperature.map(RunningTemperature::seed),
            last_energy_cumulative: first.energy_cumulative,
            alert_count: u64::from(first.alert_flags.is_active()),
            alert_kinds: first.alert_flags,
            conditions: first.conditions.clone(),
            first_sample_ms: first.timestamp_ms,
            last_sample_ms: first.timestamp_ms,
        };

        Ok(Self {
            source_id: first.source_id.clone(),
            window_start,
            window_length_secs,
            rated_power,
            state: Some(state),
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn window_start(&self) -> i64 {
        self.window_start
    }

    pub fn sample_count(&self) -> u64 {
        self.state.as_ref().map(|s| s.count).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_none()
    }

    /// Fold one sample into the running statistics
    ///
    /// All updated values are computed before anything is committed, so an
    /// overflowing sample leaves the accumulator exactly as it was.
    ///
    /// The energy counter keeps the last reading seen: a sample without
    /// `energy_cumulative` does not clear it.
    pub fn add(&mut self, sample: &Sample) -> Result<(), EngineError> {
        let overflow = || EngineError::AccumulatorOverflow {
            source_id: self.source_id.clone(),
            window_start: self.window_start,
        };

        let state = self.state.as_ref().ok_or_else(|| {
            EngineError::InvalidState(format!(
                "add on closed accumulator for '{}' window {}",
                self.source_id, self.window_start
            ))
        })?;

        let count = state.count.checked_add(1).ok_or_else(overflow)?;
        let voltage = state.voltage.push(sample.voltage).ok_or_else(overflow)?;
        let current = state.current.push(sample.current).ok_or_else(overflow)?;
        let power = state.power.push(sample.power).ok_or_else(overflow)?;
        let temperature = match (state.temperature, sample.temperature) {
            (Some(running), Some(t)) => Some(running.push(t).ok_or_else(overflow)?),
            (None, Some(t)) => Some(RunningTemperature::seed(t)),
            (running, None) => running,
        };
        let alert_count = state
            .alert_count
            .checked_add(u64::from(sample.alert_flags.is_active()))
            .ok_or_else(overflow)?;

        let Some(state) = self.state.as_mut() else {
            return Err(EngineError::InvalidState("accumulator closed during add".to_string()));
        };
        state.count = count;
        state.voltage = voltage;
        state.current = current;
        state.power = power;
        state.temperature = temperature;
        if sample.energy_cumulative.is_some() {
            state.last_energy_cumulative = sample.energy_cumulative;
        }
        state.alert_count = alert_count;
        state.alert_kinds = state.alert_kinds.union(sample.alert_flags);
        if sample.conditions.is_some() {
            state.conditions = sample.conditions.clone();
        }
        state.first_sample_ms = state.first_sample_ms.min(sample.timestamp_ms);
        state.last_sample_ms = state.last_sample_ms.max(sample.timestamp_ms);

        Ok(())
    }

    /// Finalize the window into a `SourceAggregate`
    pub fn close(&mut self) -> Result<SourceAggregate, EngineError> {
        let state = self.state.take().ok_or_else(|| {
            EngineError::InvalidState(format!(
                "accumulator for '{}' window {} already closed",
                self.source_id, self.window_start
            ))
        })?;

        let voltage = state.voltage.summarize(state.count);
        let current = state.current.summarize(state.count);
        let power = state.power.summarize(state.count);

        let efficiency_percent = if self.rated_power > 0.0 {
            power.mean / self.rated_power * 100.0
        } else {
            0.0
        };
        // Near-constant power over a short window
        let energy_delta_wh = power.mean * self.window_length_secs as f64 / 3600.0;

        Ok(SourceAggregate {
            window_start: self.window_start,
            source_id: self.source_id.clone(),
            window_length_secs: self.window_length_secs,
            sample_count: state.count,
            voltage,
            current,
            power,
            temperature: state.temperature.map(|t| t.summarize()),
            energy_delta_wh,
            energy_cumulative: state.last_energy_cumulative,
            rated_power: self.rated_power,
            efficiency_percent,
            alert_count: state.alert_count,
            alert_kinds: state.alert_kinds,
            conditions: state.conditions,
            first_sample_ms: state.first_sample_ms,
            last_sample_ms: state.last_sample_ms,
        })
    }
}
