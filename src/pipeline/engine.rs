//! Aggregation engine - orchestration layer for windowed telemetry
//!
//! ## Architecture
//!
//! ```text
//! Sample
//!     ↓
//! AggregationEngine::ingest()
//!     ↓
//! WindowClock::classify()  →  (boundary) WindowAccumulator::close()
//!     ↓                                   ↓
//! WindowAccumulator::add()          stage in pending rollups
//!                                         ↓
//!                        (every registered source staged)
//!                                         ↓
//!                       SystemRollupComputer::combine()
//!                                         ↓
//!                                    FlushBatch  →  AggregateDbWriter
//! ```
//!
//! ## Concurrency
//!
//! Accumulator state is sharded by source: ingestion for sources on different
//! shards never contends. The pending-rollup map is the only cross-source
//! structure and sits behind one mutex, taken once per closed window.
//!
//! Lock order: shard → pending → registry (read). `deregister_source` releases
//! the registry write lock before touching any other lock.
//!
//! The engine never performs I/O. `ingest`, `sweep_expired` and `flush_all`
//! return `FlushBatch`es for the caller to persist.

use super::accumulator::WindowAccumulator;
use super::error::EngineError;
use super::rollup::SystemRollupComputer;
use super::stats::{EngineEvent, EngineStats, StatsSnapshot};
use super::types::{FlushBatch, RollupCompletion, Sample, SourceAggregate, SourceInfo};
use super::windows::{format_window_start, WindowClock, MAX_WINDOW_LENGTH_SECS};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

fn poisoned(lock: &str) -> EngineError {
    EngineError::InvalidState(format!("{} lock poisoned", lock))
}

/// Finalized window starts remembered for late-correction detection
const FINALIZED_MEMORY: usize = 4096;

/// Tunables for one engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub window_length_secs: i64,
    pub shard_count: usize,
    /// How long a pending window may wait for missing sources
    pub grace_period_ms: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            window_length_secs: 1,
            shard_count: 8,
            grace_period_ms: 5_000,
        }
    }
}

#[derive(Debug)]
struct Shard {
    clock: WindowClock,
    open: HashMap<String, WindowAccumulator>,
}

#[derive(Debug)]
struct PendingWindow {
    staged: BTreeMap<String, SourceAggregate>,
    first_staged_at_ms: i64,
}

#[derive(Debug, Default)]
struct PendingRollups {
    windows: BTreeMap<i64, PendingWindow>,
    finalized: BTreeSet<i64>,
    /// Every window at or below this start has been finalized and forgotten
    finalized_floor: Option<i64>,
}

impl PendingRollups {
    fn is_finalized(&self, window_start: i64) -> bool {
        self.finalized.contains(&window_start)
            || self.finalized_floor.is_some_and(|floor| window_start <= floor)
    }

    fn mark_finalized(&mut self, window_start: i64) {
        self.finalized.insert(window_start);
        while self.finalized.len() > FINALIZED_MEMORY {
            if let Some(oldest) = self.finalized.pop_first() {
                self.finalized_floor = Some(self.finalized_floor.map_or(oldest, |f| f.max(oldest)));
            }
        }
    }
}

/// Windowed aggregation engine
///
/// Shared across tasks behind an `Arc`; every operation takes `&self`.
/// Independent instances share no state.
pub struct AggregationEngine {
    settings: EngineSettings,

    /// Registered sources and their rated power
    registry: RwLock<HashMap<String, SourceInfo>>,

    /// Per-source clocks and open accumulators, hashed by source_id
    shards: Vec<Mutex<Shard>>,

    /// window_start -> staged source aggregates awaiting system rollup
    pending: Mutex<PendingRollups>,

    /// Events produced since the last `take_events`
    events: Mutex<Vec<EngineEvent>>,

    rollup: SystemRollupComputer,
    stats: Arc<EngineStats>,

    /// Wall clock in unix milliseconds (for testing with mock time)
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl AggregationEngine {
    /// Create an engine using the system clock
    pub fn new(settings: EngineSettings) -> Self {
        Self::new_with_timestamp_fn(settings, Box::new(|| chrono::Utc::now().timestamp_millis()))
    }

    /// Create an engine with a custom clock
    ///
    /// # Arguments
    /// * `now_fn` - Function returning unix time in milliseconds
    pub fn new_with_timestamp_fn(
        settings: EngineSettings,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        let settings = EngineSettings {
            window_length_secs: settings.window_length_secs.clamp(1, MAX_WINDOW_LENGTH_SECS),
            shard_count: settings.shard_count.max(1),
            grace_period_ms: settings.grace_period_ms.max(0),
        };

        let shards = (0..settings.shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    clock: WindowClock::new(settings.window_length_secs),
                    open: HashMap::new(),
                })
            })
            .collect();

        Self {
            settings,
            registry: RwLock::new(HashMap::new()),
            shards,
            pending: Mutex::new(PendingRollups::default()),
            events: Mutex::new(Vec::new()),
            rollup: SystemRollupComputer::new(),
            stats: Arc::new(EngineStats::new()),
            now_fn,
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // ---- source registry ----

    /// Register (or update the rated power of) a source
    pub fn register_source(&self, info: SourceInfo) -> Result<(), EngineError> {
        info.validate()?;
        let mut registry = self
            .registry
            .write()
            .map_err(|_| poisoned("source registry"))?;
        log::info!("🔌 Registered source {} (rated {:.1} W)", info.source_id, info.rated_power);
        registry.insert(info.source_id.clone(), info);
        Ok(())
    }

    /// Remove a source, discard its open window, and roll up any pending
    /// windows that were only waiting for it
    pub fn deregister_source(&self, source_id: &str) -> Result<Vec<FlushBatch>, EngineError> {
        let removed = {
            let mut registry = self
                .registry
                .write()
                .map_err(|_| poisoned("source registry"))?;
            registry.remove(source_id)
        };
        if removed.is_none() {
            return Err(EngineError::UnknownSource(source_id.to_string()));
        }

        self.reset(source_id)?;
        log::info!("🔌 Deregistered source {}", source_id);

        let mut pending = self.lock_pending()?;
        let known = self.registered_ids()?;
        let ready: Vec<i64> = pending
            .windows
            .iter()
            .filter(|(_, w)| known.iter().all(|id| w.staged.contains_key(id)))
            .map(|(ws, _)| *ws)
            .collect();

        let mut batches = Vec::with_capacity(ready.len());
        for window_start in ready {
            let batch =
                self.finalize(&mut pending, &known, window_start, RollupCompletion::Complete)?;
            batches.push(batch);
        }
        Ok(batches)
    }

    pub fn registered_sources(&self) -> Vec<SourceInfo> {
        let mut sources: Vec<SourceInfo> = match self.registry.read() {
            Ok(registry) => registry.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        sources.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        sources
    }

    fn registered_ids(&self) -> Result<HashSet<String>, EngineError> {
        let registry = self
            .registry
            .read()
            .map_err(|_| poisoned("source registry"))?;
        Ok(registry.keys().cloned().collect())
    }

    fn rated_power(&self, source_id: &str) -> Result<f64, EngineError> {
        let registry = self
            .registry
            .read()
            .map_err(|_| poisoned("source registry"))?;
        registry
            .get(source_id)
            .map(|info| info.rated_power)
            .ok_or_else(|| EngineError::UnknownSource(source_id.to_string()))
    }

    // ---- ingestion ----

    /// Ingest one sample
    ///
    /// Returns the batches made ready by this sample (usually none). Errors are
    /// local to the sample: the engine state for every source is unchanged
    /// when an error is returned.
    pub fn ingest(&self, sample: Sample) -> Result<Vec<FlushBatch>, EngineError> {
        let result = self.ingest_sample(&sample);
        match &result {
            Ok(_) => EngineStats::incr(&self.stats.samples_ingested),
            Err(e) => self.stats.record_rejection(e),
        }
        result
    }

    fn ingest_sample(&self, sample: &Sample) -> Result<Vec<FlushBatch>, EngineError> {
        sample.validate()?;
        let rated_power = self.rated_power(&sample.source_id)?;
        let source_id = sample.source_id.as_str();

        let closed = {
            let mut shard = self.lock_shard(source_id)?;
            let shard = &mut *shard;
            let assignment = shard.clock.classify(source_id, sample.timestamp_ms)?;

            if assignment.is_new_window {
                let fresh = match WindowAccumulator::open(
                    sample,
                    assignment.window_start,
                    self.settings.window_length_secs,
                    rated_power,
                ) {
                    Ok(acc) => acc,
                    Err(e) => {
                        shard.clock.rewind(source_id, assignment.previous_window);
                        return Err(e);
                    }
                };

                match shard.open.insert(source_id.to_string(), fresh) {
                    Some(mut previous) => Some(previous.close()?),
                    None => None,
                }
            } else {
                // Window already drained by flush_all
                let sample_window = shard.clock.window_start_for(sample.timestamp_ms);
                let acc =
                    shard.open.get_mut(source_id).ok_or_else(|| EngineError::LateWindowDiscarded {
                        source_id: source_id.to_string(),
                        window_start: sample_window,
                        open_window_start: assignment.window_start,
                    })?;
                acc.add(sample)?;
                if assignment.folded_late {
                    log::debug!(
                        "↩️  Folded late sample from {} into open window {}",
                        source_id,
                        assignment.window_start
                    );
                }
                None
            }
        };

        match closed {
            Some(aggregate) => {
                EngineStats::incr(&self.stats.windows_closed);
                self.stage(vec![aggregate])
            }
            None => Ok(Vec::new()),
        }
    }

    // ---- rollups ----

    /// Stage closed aggregates and roll up every window that became complete
    fn stage(&self, aggregates: Vec<SourceAggregate>) -> Result<Vec<FlushBatch>, EngineError> {
        let now = (self.now_fn)();
        let mut pending = self.lock_pending()?;
        let known = self.registered_ids()?;
        let mut batches = Vec::new();
        let mut touched = BTreeSet::new();

        for aggregate in aggregates {
            let window_start = aggregate.window_start;

            if pending.is_finalized(window_start) {
                // System row already written; upsert the source row on its own
                EngineStats::incr(&self.stats.late_corrections);
                log::warn!(
                    "⚠️  Late aggregate for {} in finalized window {}, source row only",
                    aggregate.source_id,
                    format_window_start(window_start)
                );
                let event = EngineEvent::late_correction(now, &aggregate.source_id, window_start);
                self.push_event(event);
                batches.push(FlushBatch {
                    window_start,
                    sources: vec![aggregate],
                    system: None,
                });
                continue;
            }

            pending
                .windows
                .entry(window_start)
                .or_insert_with(|| PendingWindow {
                    staged: BTreeMap::new(),
                    first_staged_at_ms: now,
                })
                .staged
                .insert(aggregate.source_id.clone(), aggregate);
            touched.insert(window_start);
        }

        for window_start in touched {
            let complete = pending
                .windows
                .get(&window_start)
                .is_some_and(|w| known.iter().all(|id| w.staged.contains_key(id)));
            if complete {
                let batch =
                self.finalize(&mut pending, &known, window_start, RollupCompletion::Complete)?;
            batches.push(batch);
            }
        }

        Ok(batches)
    }

    /// Remove a pending window and build its batch
    fn finalize(
        &self,
        pending: &mut PendingRollups,
        known: &HashSet<String>,
        window_start: i64,
        completion: RollupCompletion,
    ) -> Result<FlushBatch, EngineError> {
        let window = pending
            .windows
            .remove(&window_start)
            .ok_or_else(|| {
                EngineError::InvalidState(format!("no pending window {}", window_start))
            })?;

        let sources: Vec<SourceAggregate> = window.staged.into_values().collect();
        let mut system = self.rollup.combine(window_start, &sources)?;
        system.total_known_sources = known
            .len()
            + sources.iter().filter(|s| !known.contains(&s.source_id)).count();
        system.completion = completion;

        pending.mark_finalized(window_start);

        let counter = match completion {
            RollupCompletion::Complete => &self.stats.rollups_complete,
            RollupCompletion::TimedOut => &self.stats.rollups_timed_out,
            RollupCompletion::Drained => &self.stats.rollups_drained,
        };
        EngineStats::incr(counter);

        log::debug!(
            "🧮 Rolled up window {} ({}): {}/{} sources, {:.2} W total",
            format_window_start(window_start),
            completion.as_str(),
            system.active_source_count,
            system.total_known_sources,
            system.total_power_mean
        );

        Ok(FlushBatch {
            window_start,
            sources,
            system: Some(system),
        })
    }

    /// Force rollups for pending windows older than the grace period
    ///
    /// Each forced rollup is flagged `TimedOut` and recorded as an
    /// `IncompleteRollupTimeout` event.
    pub fn sweep_expired(&self) -> Result<Vec<FlushBatch>, EngineError> {
        let now = (self.now_fn)();
        let mut pending = self.lock_pending()?;
        let known = self.registered_ids()?;

        let expired: Vec<(i64, Vec<String>)> = pending
            .windows
            .iter()
            .filter(|(_, w)| now - w.first_staged_at_ms >= self.settings.grace_period_ms)
            .map(|(ws, w)| {
                let mut missing: Vec<String> = known
                    .iter()
                    .filter(|id| !w.staged.contains_key(*id))
                    .cloned()
                    .collect();
                missing.sort();
                (*ws, missing)
            })
            .collect();

        let mut batches = Vec::with_capacity(expired.len());
        for (window_start, missing) in expired {
            let batch =
                self.finalize(&mut pending, &known, window_start, RollupCompletion::TimedOut)?;
            if let Some(system) = &batch.system {
                let timeout = EngineError::IncompleteRollupTimeout {
                    window_start,
                    active_sources: system.active_source_count,
                    known_sources: system.total_known_sources,
                };
                log::warn!("⏱️  {} (missing: {})", timeout, missing.join(", "));
                self.push_event(EngineEvent::rollup_timeout(now, &timeout, &missing));
            }
            batches.push(batch);
        }

        Ok(batches)
    }

    /// Close every open accumulator and roll up every pending window
    ///
    /// Windows that still miss sources are rolled up with whatever reported and
    /// flagged `Drained`. The per-source clocks are kept, so a later sample for a
    /// drained window is rejected as late.
    pub fn flush_all(&self) -> Result<Vec<FlushBatch>, EngineError> {
        let mut closed = Vec::new();
        for shard in &self.shards {
            let mut shard = shard
                .lock()
                .map_err(|_| poisoned("accumulator shard"))?;
            for (_, mut acc) in shard.open.drain() {
                closed.push(acc.close()?);
                EngineStats::incr(&self.stats.windows_closed);
            }
        }

        let mut batches = self.stage(closed)?;

        let mut pending = self.lock_pending()?;
        let known = self.registered_ids()?;
        let remaining: Vec<i64> = pending.windows.keys().copied().collect();
        for window_start in remaining {
            let batch =
                self.finalize(&mut pending, &known, window_start, RollupCompletion::Drained)?;
            batches.push(batch);
        }

        batches.sort_by_key(|b| b.window_start);
        if !batches.is_empty() {
            log::info!("🔄 flush_all produced {} batch(es)", batches.len());
        }
        Ok(batches)
    }

    /// Discard a source's open window without persisting it
    ///
    /// Returns true if an open accumulator was dropped.
    pub fn reset(&self, source_id: &str) -> Result<bool, EngineError> {
        let mut shard = self.lock_shard(source_id)?;
        shard.clock.forget(source_id);
        let discarded = shard.open.remove(source_id);
        if let Some(acc) = &discarded {
            log::info!(
                "🗑️  Discarded open window {} for {} ({} samples)",
                format_window_start(acc.window_start()),
                source_id,
                acc.sample_count()
            );
        }
        Ok(discarded.is_some())
    }

    // ---- introspection ----

    pub fn open_window_count(&self) -> usize {
        self.shards
            .iter()
            .filter_map(|s| s.lock().ok().map(|shard| shard.open.len()))
            .sum()
    }

    pub fn pending_windows(&self) -> Vec<i64> {
        match self.pending.lock() {
            Ok(pending) => pending.windows.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Drain events recorded since the last call
    pub fn take_events(&self) -> Vec<EngineEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(_) => Vec::new(),
        }
    }

    fn push_event(&self, event: EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn shard_index(&self, source_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        source_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn lock_shard(&self, source_id: &str) -> Result<MutexGuard<'_, Shard>, EngineError> {
        self.shards[self.shard_index(source_id)]
            .lock()
            .map_err(|_| poisoned("accumulator shard"))
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, PendingRollups>, EngineError> {
        self.pending
            .lock()
            .map_err(|_| poisoned("pending rollup"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn engine_with_clock(clock: Arc<AtomicI64>) -> AggregationEngine {
        AggregationEngine::new_with_timestamp_fn(
            EngineSettings::default(),
            Box::new(move || clock.load(Ordering::SeqCst)),
        )
    }

    fn engine() -> AggregationEngine {
        engine_with_clock(Arc::new(AtomicI64::new(1_000_000)))
    }

    fn sample(source_id: &str, ts_ms: i64, power: f64) -> Sample {
        Sample::new(source_id, ts_ms, 24.0, power / 24.0, power)
    }

    fn register(engine: &AggregationEngine, ids: &[&str]) {
        for id in ids {
            engine.register_source(SourceInfo::new(*id, 100.0)).unwrap();
        }
    }

    #[test]
    fn test_boundary_crossing_closes_single_source_window() {
        let engine = engine();
        register(&engine, &["A"]);

        for (i, p) in [10.0, 12.0, 11.0, 13.0].iter().enumerate() {
            assert!(engine.ingest(sample("A", 10_000 + i as i64 * 100, *p)).unwrap().is_empty());
        }

        let batches = engine.ingest(sample("A", 11_000, 50.0)).unwrap();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.window_start, 10);
        assert_eq!(batch.sources.len(), 1);
        assert!((batch.sources[0].power.mean - 11.5).abs() < 1e-9);
        assert_eq!(batch.sources[0].power.min, 10.0);
        assert_eq!(batch.sources[0].power.max, 13.0);

        let system = batch.system.as_ref().unwrap();
        assert_eq!(system.completion, RollupCompletion::Complete);
        assert_eq!(system.active_source_count, 1);
        assert_eq!(engine.open_window_count(), 1);
    }

    #[test]
    fn test_system_rollup_waits_for_every_registered_source() {
        let engine = engine();
        register(&engine, &["A", "B"]);

        for p in [10.0, 12.0, 11.0, 13.0] {
            engine.ingest(sample("A", 10_100, p)).unwrap();
        }
        engine.ingest(sample("B", 10_200, 20.0)).unwrap();

        // A crosses first: window 10 is staged but incomplete
        assert!(engine.ingest(sample("A", 11_000, 1.0)).unwrap().is_empty());
        assert_eq!(engine.pending_windows(), vec![10]);

        let batches = engine.ingest(sample("B", 11_100, 1.0)).unwrap();
        assert_eq!(batches.len(), 1);
        let system = batches[0].system.as_ref().unwrap();
        assert!((system.total_power_mean - 31.5).abs() < 1e-9);
        assert_eq!(system.best_source_id, "B");
        assert_eq!(system.worst_source_id, "A");
        assert_eq!(system.total_known_sources, 2);
        assert!(!system.is_partial());
        assert!(engine.pending_windows().is_empty());
    }

    #[test]
    fn test_flush_all_single_open_accumulator() {
        let engine = engine();
        register(&engine, &["A"]);
        engine.ingest(sample("A", 10_000, 7.0)).unwrap();

        let batches = engine.flush_all().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].sources.len(), 1);
        let system = batches[0].system.as_ref().unwrap();
        assert_eq!(system.active_source_count, 1);
        assert_eq!(engine.open_window_count(), 0);
        assert!(engine.flush_all().unwrap().is_empty());
    }

    #[test]
    fn test_flush_all_drains_incomplete_window_as_partial() {
        let engine = engine();
        register(&engine, &["A", "B"]);
        engine.ingest(sample("A", 10_000, 7.0)).unwrap();

        let batches = engine.flush_all().unwrap();
        let system = batches[0].system.as_ref().unwrap();
        assert_eq!(system.completion, RollupCompletion::Drained);
        assert!(system.is_partial());
        assert_eq!(engine.stats_snapshot().rollups_drained, 1);
    }

    #[test]
    fn test_late_sample_rejected_without_mutation() {
        let engine = engine();
        register(&engine, &["A"]);
        engine.ingest(sample("A", 10_000, 5.0)).unwrap();
        engine.ingest(sample("A", 12_000, 5.0)).unwrap();

        let err = engine.ingest(sample("A", 10_500, 999.0)).unwrap_err();
        assert!(matches!(err, EngineError::LateWindowDiscarded { .. }));
        assert!(err.is_warning());

        // One window behind is folded into the open window
        engine.ingest(sample("A", 11_500, 7.0)).unwrap();
        let batches = engine.flush_all().unwrap();
        let agg = &batches[0].sources[0];
        assert_eq!(agg.window_start, 12);
        assert_eq!(agg.sample_count, 2);
        assert_eq!(agg.power.max, 7.0);

        let stats = engine.stats_snapshot();
        assert_eq!(stats.samples_late, 1);
        assert_eq!(stats.samples_ingested, 3);
    }

    #[test]
    fn test_sample_for_drained_window_is_late() {
        let engine = engine();
        register(&engine, &["A"]);
        engine.ingest(sample("A", 10_000, 5.0)).unwrap();
        engine.flush_all().unwrap();

        assert!(matches!(
            engine.ingest(sample("A", 10_500, 5.0)),
            Err(EngineError::LateWindowDiscarded { .. })
        ));
        // Next window opens normally
        assert!(engine.ingest(sample("A", 11_000, 5.0)).is_ok());
        assert_eq!(engine.open_window_count(), 1);
    }

    #[test]
    fn test_unknown_and_malformed_samples_are_local() {
        let engine = engine();
        register(&engine, &["A"]);
        engine.ingest(sample("A", 10_000, 5.0)).unwrap();

        assert!(matches!(
            engine.ingest(sample("ghost", 10_000, 5.0)),
            Err(EngineError::UnknownSource(_))
        ));
        assert!(matches!(
            engine.ingest(sample("A", 10_100, f64::NAN)),
            Err(EngineError::MalformedSample { .. })
        ));

        let batches = engine.flush_all().unwrap();
        assert_eq!(batches[0].sources[0].sample_count, 1);
        let stats = engine.stats_snapshot();
        assert_eq!(stats.samples_unknown_source, 1);
        assert_eq!(stats.samples_malformed, 1);
    }

    #[test]
    fn test_grace_period_forces_partial_rollup() {
        let clock = Arc::new(AtomicI64::new(1_000_000));
        let engine = engine_with_clock(Arc::clone(&clock));
        register(&engine, &["A", "B"]);

        engine.ingest(sample("A", 10_000, 5.0)).unwrap();
        engine.ingest(sample("A", 11_000, 5.0)).unwrap();
        assert!(engine.sweep_expired().unwrap().is_empty());

        clock.fetch_add(5_000, Ordering::SeqCst);
        let batches = engine.sweep_expired().unwrap();
        assert_eq!(batches.len(), 1);
        let system = batches[0].system.as_ref().unwrap();
        assert_eq!(system.completion, RollupCompletion::TimedOut);
        assert_eq!(system.active_source_count, 1);
        assert_eq!(system.total_known_sources, 2);

        let events = engine.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EngineEvent::ROLLUP_TIMEOUT);
        assert!(engine.take_events().is_empty());
    }

    #[test]
    fn test_late_aggregate_for_finalized_window_is_corrective() {
        let clock = Arc::new(AtomicI64::new(1_000_000));
        let engine = engine_with_clock(Arc::clone(&clock));
        register(&engine, &["A", "B"]);

        engine.ingest(sample("A", 10_000, 5.0)).unwrap();
        engine.ingest(sample("A", 11_000, 5.0)).unwrap();
        clock.fetch_add(10_000, Ordering::SeqCst);
        engine.sweep_expired().unwrap();
        engine.take_events();

        // B finally reports window 10 and crosses into 11
        engine.ingest(sample("B", 10_500, 9.0)).unwrap();
        let batches = engine.ingest(sample("B", 11_200, 9.0)).unwrap();

        let corrective: Vec<&FlushBatch> =
            batches.iter().filter(|b| b.window_start == 10).collect();
        assert_eq!(corrective.len(), 1);
        assert!(corrective[0].system.is_none());
        assert_eq!(corrective[0].sources[0].source_id, "B");
        assert_eq!(engine.stats_snapshot().late_corrections, 1);
        assert_eq!(engine.take_events()[0].event_type, EngineEvent::LATE_CORRECTION);
    }

    #[test]
    fn test_reset_discards_without_persisting() {
        let engine = engine();
        register(&engine, &["A"]);
        engine.ingest(sample("A", 10_000, 5.0)).unwrap();

        assert!(engine.reset("A").unwrap());
        assert!(!engine.reset("A").unwrap());
        assert!(engine.flush_all().unwrap().is_empty());
    }

    #[test]
    fn test_deregister_unblocks_pending_window() {
        let engine = engine();
        register(&engine, &["A", "B"]);
        engine.ingest(sample("A", 10_000, 5.0)).unwrap();
        engine.ingest(sample("A", 11_000, 5.0)).unwrap();
        assert_eq!(engine.pending_windows(), vec![10]);

        let batches = engine.deregister_source("B").unwrap();
        assert_eq!(batches.len(), 1);
        let system = batches[0].system.as_ref().unwrap();
        assert_eq!(system.completion, RollupCompletion::Complete);
        assert_eq!(system.total_known_sources, 1);
        assert_eq!(engine.registered_sources().len(), 1);
        assert!(matches!(engine.deregister_source("B"), Err(EngineError::UnknownSource(_))));
    }

    #[test]
    fn test_register_rejects_invalid_rated_power() {
        let engine = engine();
        assert!(matches!(
            engine.register_source(SourceInfo::new("A", -1.0)),
            Err(EngineError::InvalidSource { .. })
        ));
        assert!(engine.registered_sources().is_empty());
    }

    #[test]
    fn test_oversized_window_length_clamped_to_one_day() {
        let engine = AggregationEngine::new(EngineSettings {
            window_length_secs: 10_000_000_000_000_000,
            ..EngineSettings::default()
        });
        assert_eq!(engine.settings().window_length_secs, MAX_WINDOW_LENGTH_SECS);
        register(&engine, &["A"]);

        assert!(engine.ingest(sample("A", 1_000, 5.0)).unwrap().is_empty());
        let batches = engine.flush_all().unwrap();
        assert_eq!(batches[0].window_start, 0);
        assert_eq!(batches[0].sources[0].window_length_secs, MAX_WINDOW_LENGTH_SECS);
    }

    #[test]
    fn test_independent_engines_share_nothing() {
        let first = engine();
        let second = engine();
        register(&first, &["A"]);

        first.ingest(sample("A", 10_000, 5.0)).unwrap();
        assert!(matches!(
            second.ingest(sample("A", 10_000, 5.0)),
            Err(EngineError::UnknownSource(_))
        ));
        assert_eq!(second.open_window_count(), 0);
    }
}
