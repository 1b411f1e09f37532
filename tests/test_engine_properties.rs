//! Property-style checks of the aggregation engine over generated sample streams
//!
//! Streams are generated deterministically (xorshift) so failures reproduce.

#[cfg(test)]
mod engine_property_tests {
    use panelflow::pipeline::{
        AggregationEngine, EngineError, EngineSettings, FlushBatch, RollupCompletion, Sample,
        SourceInfo,
    };
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::thread;

    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn unit(&mut self) -> f64 {
            (self.next() % 1_000_000) as f64 / 1_000_000.0
        }
    }

    fn engine(ids: &[&str], window_length_secs: i64) -> AggregationEngine {
        let engine = AggregationEngine::new_with_timestamp_fn(
            EngineSettings {
                window_length_secs,
                shard_count: 3,
                grace_period_ms: 60_000,
            },
            Box::new(|| 0),
        );
        for id in ids {
            engine.register_source(SourceInfo::new(*id, 100.0)).unwrap();
        }
        engine
    }

    /// Monotonic stream of samples across several windows for each source
    fn generate(ids: &[&str], per_source: usize, seed: u64) -> Vec<Sample> {
        let mut rng = XorShift(seed);
        let mut samples = Vec::new();
        let mut clocks: Vec<i64> = vec![1_000_000; ids.len()];

        for _ in 0..per_source {
            for (i, id) in ids.iter().enumerate() {
                clocks[i] += 50 + (rng.next() % 400) as i64;
                let power = 5.0 + rng.unit() * 95.0;
                let voltage = 20.0 + rng.unit() * 10.0;
                samples.push(Sample::new(*id, clocks[i], voltage, power / 24.0, power));
            }
        }
        samples
    }

    fn run(engine: &AggregationEngine, samples: &[Sample]) -> Vec<FlushBatch> {
        let mut batches = Vec::new();
        for sample in samples {
            batches.extend(engine.ingest(sample.clone()).unwrap());
        }
        batches.extend(engine.flush_all().unwrap());
        batches
    }

    #[test]
    fn test_window_statistics_match_samples() {
        let ids = ["A", "B", "C"];
        let samples = generate(&ids, 200, 0x9E37_79B9_7F4A_7C15);
        let engine = engine(&ids, 1);
        let batches = run(&engine, &samples);

        // Group raw samples by (window, source)
        let mut expected: BTreeMap<(i64, String), Vec<f64>> = BTreeMap::new();
        for s in &samples {
            expected
                .entry((s.timestamp_ms.div_euclid(1_000), s.source_id.clone()))
                .or_default()
                .push(s.power);
        }

        let mut seen = 0;
        for batch in &batches {
            for agg in &batch.sources {
                let powers = &expected[&(agg.window_start, agg.source_id.clone())];
                let mean = powers.iter().sum::<f64>() / powers.len() as f64;

                assert_eq!(agg.sample_count as usize, powers.len());
                assert!((agg.power.mean - mean).abs() < 1e-9);
                for p in powers {
                    assert!(agg.power.min <= *p && *p <= agg.power.max);
                }
                seen += 1;
            }
        }
        assert_eq!(seen, expected.len());
    }

    #[test]
    fn test_every_window_rolled_up_once_and_complete() {
        let ids = ["A", "B"];
        let samples = generate(&ids, 150, 42);
        let engine = engine(&ids, 1);
        let batches = run(&engine, &samples);

        let mut system_windows = BTreeSet::new();
        for batch in &batches {
            let system = batch.system.as_ref().unwrap();
            assert!(system_windows.insert(batch.window_start), "window rolled up twice");
            // A system row always covers every staged source of its window
            assert_eq!(system.active_source_count, batch.sources.len());
            let total: f64 = batch.sources.iter().map(|s| s.power.mean).sum();
            assert!((system.total_power_mean - total).abs() < 1e-9);
        }

        let stats = engine.stats_snapshot();
        assert_eq!(stats.samples_ingested as usize, samples.len());
        assert_eq!(
            stats.rollups_complete + stats.rollups_drained,
            system_windows.len() as u64
        );
    }

    #[test]
    fn test_stale_samples_never_touch_flushed_rows() {
        let ids = ["A"];
        let engine = engine(&ids, 2);
        let mut batches = Vec::new();

        for ts in [10_000, 10_500, 12_000, 14_100] {
            batches.extend(engine.ingest(Sample::new("A", ts, 24.0, 1.0, 24.0)).unwrap());
        }
        let flushed_before = batches.clone();

        // Open window is 14; window 10 is more than one window behind
        let err = engine.ingest(Sample::new("A", 10_200, 24.0, 1.0, 999.0)).unwrap_err();
        assert!(matches!(err, EngineError::LateWindowDiscarded { .. }));

        let remaining = engine.flush_all().unwrap();
        assert_eq!(flushed_before.len(), 2);
        assert!(remaining.iter().all(|b| b.window_start == 14));
        assert!(remaining
            .iter()
            .flat_map(|b| &b.sources)
            .all(|s| s.power.max < 999.0));
    }

    #[test]
    fn test_parallel_ingest_across_sources() {
        const SOURCES: usize = 8;
        const WINDOWS: i64 = 50;
        const PER_WINDOW: i64 = 20;

        let ids: Vec<String> = (0..SOURCES).map(|i| format!("PS100_{:02}", i)).collect();
        let engine = Arc::new(AggregationEngine::new_with_timestamp_fn(
            EngineSettings {
                window_length_secs: 1,
                shard_count: 4,
                grace_period_ms: 60_000,
            },
            Box::new(|| 0),
        ));
        for id in &ids {
            engine.register_source(SourceInfo::new(id.clone(), 100.0)).unwrap();
        }

        let workers: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let engine = Arc::clone(&engine);
                let id = id.clone();
                thread::spawn(move || {
                    let mut batches = Vec::new();
                    for window in 0..WINDOWS {
                        for n in 0..PER_WINDOW {
                            let ts = 500_000 + window * 1_000 + n * (1_000 / PER_WINDOW);
                            let power = 10.0 * (i + 1) as f64;
                            let sample = Sample::new(id.as_str(), ts, 24.0, power / 24.0, power);
                            batches.extend(engine.ingest(sample).unwrap());
                        }
                    }
                    batches
                })
            })
            .collect();

        let mut batches: Vec<FlushBatch> = Vec::new();
        for worker in workers {
            batches.extend(worker.join().unwrap());
        }
        batches.extend(engine.flush_all().unwrap());

        let mut seen = BTreeSet::new();
        let mut samples = 0u64;
        let expected_total: f64 = (1..=SOURCES).map(|i| 10.0 * i as f64).sum();
        for batch in &batches {
            let system = batch.system.as_ref().unwrap();
            assert!(
                seen.insert(batch.window_start),
                "window {} rolled up twice",
                batch.window_start
            );
            assert_eq!(system.active_source_count, SOURCES);
            assert_eq!(batch.sources.len(), SOURCES);
            assert!((system.total_power_mean - expected_total).abs() < 1e-9);

            let last_window = 500 + WINDOWS - 1;
            let expected_completion = if batch.window_start == last_window {
                RollupCompletion::Drained
            } else {
                RollupCompletion::Complete
            };
            assert_eq!(system.completion, expected_completion);

            samples += batch.sources.iter().map(|s| s.sample_count).sum::<u64>();
        }

        assert_eq!(seen, (500..500 + WINDOWS).collect::<BTreeSet<_>>());
        assert_eq!(samples, SOURCES as u64 * WINDOWS as u64 * PER_WINDOW as u64);

        let stats = engine.stats_snapshot();
        assert_eq!(stats.samples_ingested, samples);
        assert_eq!(stats.samples_rejected(), 0);
        assert_eq!(stats.rollups_complete, WINDOWS as u64 - 1);
        assert_eq!(stats.rollups_drained, 1);
    }
}
