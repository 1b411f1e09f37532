//! Cross-source system rollup
//!
//! `SystemRollupComputer::combine` is a pure function over the closed
//! `SourceAggregate`s of one window.
//!
//! Known approximation: `total_power_peak` is the sum of per-source power
//! maxima. Per-source peaks need not be coincident, so this is an upper bound
//! on the true system peak. Computing the coincident peak would require the
//! raw per-sample series, which the engine does not retain.

use super::error::EngineError;
use super::types::{RollupCompletion, SourceAggregate, SystemAggregate};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRollupComputer;

impl SystemRollupComputer {
    pub fn new() -> Self {
        Self
    }

    /// Combine one window's source aggregates into a system row
    ///
    /// `total_known_sources` and `completion` are set by the caller, which
    /// owns the registry; here they default to the sources present and
    /// `Complete`.
    pub fn combine(
        &self,
        window_start: i64,
        sources: &[SourceAggregate],
    ) -> Result<SystemAggregate, EngineError> {
        let first = sources.first().ok_or_else(|| {
            EngineError::InvalidState(format!(
                "system rollup for window {} with no sources",
                window_start
            ))
        })?;

        if let Some(stray) = sources.iter().find(|s| s.window_start != window_start) {
            return Err(EngineError::InvalidState(format!(
                "source '{}' aggregate for window {} passed to rollup of window {}",
                stray.source_id, stray.window_start, window_start
            )));
        }

        let mut best = first;
        let mut worst = first;
        // Ties go to the lexicographically smallest source_id
        for agg in &sources[1..] {
            match agg.power.mean.total_cmp(&best.power.mean) {
                Ordering::Greater => best = agg,
                Ordering::Equal if agg.source_id < best.source_id => best = agg,
                _ => {}
            }
            match agg.power.mean.total_cmp(&worst.power.mean) {
                Ordering::Less => worst = agg,
                Ordering::Equal if agg.source_id < worst.source_id => worst = agg,
                _ => {}
            }
        }

        let total_power_mean: f64 = sources.iter().map(|s| s.power.mean).sum();
        let total_power_peak: f64 = sources.iter().map(|s| s.power.max).sum();
        let total_current_mean: f64 = sources.iter().map(|s| s.current.mean).sum();
        let total_energy_wh: f64 = sources.iter().map(|s| s.energy_delta_wh).sum();
        let system_voltage_mean =
            sources.iter().map(|s| s.voltage.mean).sum::<f64>() / sources.len() as f64;
        let total_rated: f64 = sources.iter().map(|s| s.rated_power).sum();
        let system_efficiency_percent = if total_rated > 0.0 {
            total_power_mean / total_rated * 100.0
        } else {
            0.0
        };

        Ok(SystemAggregate {
            window_start,
            total_power_mean,
            total_power_peak,
            total_current_mean,
            total_energy_wh,
            system_voltage_mean,
            system_efficiency_percent,
            active_source_count: sources.len(),
            total_known_sources: sources.len(),
            best_source_id: best.source_id.clone(),
            worst_source_id: worst.source_id.clone(),
            best_source_power: best.power.mean,
            worst_source_power: worst.power.mean,
            total_alerts: sources.iter().map(|s| s.alert_count).sum(),
            completion: RollupCompletion::Complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{AlertFlags, MetricSummary};

    fn metric(mean: f64, max: f64) -> MetricSummary {
        MetricSummary {
            mean,
            min: mean,
            max,
            stddev: 0.0,
        }
    }

    fn aggregate(source_id: &str, power_mean: f64, power_max: f64) -> SourceAggregate {
        SourceAggregate {
            window_start: 100,
            source_id: source_id.to_string(),
            window_length_secs: 1,
            sample_count: 4,
            voltage: metric(24.0, 24.0),
            current: metric(power_mean / 24.0, power_max / 24.0),
            power: metric(power_mean, power_max),
            temperature: None,
            energy_delta_wh: power_mean / 3600.0,
            energy_cumulative: None,
            rated_power: 100.0,
            efficiency_percent: power_mean,
            alert_count: 1,
            alert_kinds: AlertFlags::empty(),
            conditions: None,
            first_sample_ms: 100_000,
            last_sample_ms: 100_900,
        }
    }

    #[test]
    fn test_two_source_totals() {
        let computer = SystemRollupComputer::new();
        let system = computer
            .combine(100, &[aggregate("A", 11.5, 13.0), aggregate("B", 20.0, 22.0)])
            .unwrap();

        assert!((system.total_power_mean - 31.5).abs() < 1e-9);
        assert!((system.total_power_peak - 35.0).abs() < 1e-9);
        assert_eq!(system.best_source_id, "B");
        assert_eq!(system.worst_source_id, "A");
        assert_eq!(system.active_source_count, 2);
        assert_eq!(system.total_alerts, 2);
        assert!((system.system_efficiency_percent - 15.75).abs() < 1e-9);
        assert_eq!(system.completion, RollupCompletion::Complete);
    }

    #[test]
    fn test_ties_go_to_smallest_id() {
        let computer = SystemRollupComputer::new();
        let system = computer
            .combine(
                100,
                &[
                    aggregate("C", 10.0, 10.0),
                    aggregate("A", 10.0, 10.0),
                    aggregate("B", 10.0, 10.0),
                ],
            )
            .unwrap();

        assert_eq!(system.best_source_id, "A");
        assert_eq!(system.worst_source_id, "A");
    }

    #[test]
    fn test_tie_for_worst_only() {
        let computer = SystemRollupComputer::new();
        let system = computer
            .combine(
                100,
                &[aggregate("Z", 50.0, 50.0), aggregate("M", 5.0, 5.0), aggregate("D", 5.0, 5.0)],
            )
            .unwrap();

        assert_eq!(system.best_source_id, "Z");
        assert_eq!(system.worst_source_id, "D");
    }

    #[test]
    fn test_empty_rollup_is_invalid_state() {
        let computer = SystemRollupComputer::new();
        assert!(matches!(computer.combine(100, &[]), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn test_mismatched_window_rejected() {
        let computer = SystemRollupComputer::new();
        let mut stray = aggregate("B", 1.0, 1.0);
        stray.window_start = 101;
        assert!(computer.combine(100, &[aggregate("A", 1.0, 1.0), stray]).is_err());
    }
}
