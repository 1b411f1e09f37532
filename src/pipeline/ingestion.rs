//! Pipeline ingestion - async sample processor and persistence worker
//!
//! Two tasks:
//! 1. `start_pipeline_ingestion` drains the sample channel into the engine,
//!    sweeps expired rollups on a timer, and forwards every ready
//!    `FlushBatch` and engine event to the persistence queue.
//! 2. `run_persistence_worker` writes queued jobs in order, holding failed
//!    jobs in memory and retrying with exponential backoff until they succeed
//!    or the pipeline is torn down.
//!
//! The persistence queue is unbounded so a slow or failing store never blocks
//! sample ingestion.
//!
//! Shutdown (`PipelineHandle::shutdown`):
//! `Running → Draining` stops ingestion, processes already-buffered samples and
//! runs `flush_all`. The worker keeps retrying until its queue is empty or the
//! drain timeout elapses, then `Draining → TornDown` cancels retry sleeps and
//! gives each remaining job `final_flush_attempts` last attempts. Anything still
//! failing is listed in the returned `PersistenceReport`.

use super::config::PipelineConfig;
use super::db::AggregateDbWriter;
use super::engine::AggregationEngine;
use super::error::{EngineError, StorageError};
use super::retry::ExponentialBackoff;
use super::stats::{EngineEvent, EngineStats};
use super::types::{FlushBatch, Sample};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

/// Unit of work for the persistence worker
#[derive(Debug, Clone)]
pub enum PersistJob {
    Batch(FlushBatch),
    Event(EngineEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Stop ingesting and flush; persistence keeps retrying
    Draining,
    /// Stop retrying; make final attempts and report
    TornDown,
}

/// Retry behaviour of the persistence worker
#[derive(Debug, Clone, Copy)]
pub struct PersistenceSettings {
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub final_flush_attempts: u32,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            retry_initial_ms: 250,
            retry_max_ms: 30_000,
            final_flush_attempts: 3,
        }
    }
}

/// Everything `spawn_pipeline` needs besides the engine and the writer
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub channel_buffer: usize,
    pub sweep_interval: Duration,
    pub drain_timeout: Duration,
    pub persistence: PersistenceSettings,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            channel_buffer: 10_000,
            sweep_interval: Duration::from_millis(1_000),
            drain_timeout: Duration::from_millis(10_000),
            persistence: PersistenceSettings::default(),
        }
    }
}

impl From<&PipelineConfig> for PipelineOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            channel_buffer: config.channel_buffer,
            sweep_interval: config.sweep_interval(),
            drain_timeout: config.drain_timeout(),
            persistence: PersistenceSettings {
                retry_initial_ms: config.persist_retry_initial_ms,
                retry_max_ms: config.persist_retry_max_ms,
                final_flush_attempts: config.final_flush_attempts,
            },
        }
    }
}

/// A batch that could not be written before teardown
#[derive(Debug, Clone, PartialEq)]
pub struct FailedBatch {
    pub window_start: i64,
    pub source_rows: usize,
    pub has_system_row: bool,
    pub error: String,
}

/// Outcome of the persistence worker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistenceReport {
    pub batches_persisted: usize,
    pub events_persisted: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub failed_events: usize,
}

impl PersistenceReport {
    pub fn is_clean(&self) -> bool {
        self.failed_batches.is_empty() && self.failed_events == 0
    }

    /// `PersistenceFailure` if any batch was never written
    pub fn into_result(self) -> Result<Self, EngineError> {
        match self.failed_batches.last() {
            Some(last) => Err(EngineError::PersistenceFailure {
                failed_batches: self.failed_batches.len(),
                last_error: last.error.clone(),
            }),
            None => Ok(self),
        }
    }
}

/// Start pipeline ingestion from the sample channel
///
/// Main loop:
/// 1. Receives samples and feeds them to the engine
/// 2. Forwards batches made ready by boundary crossings
/// 3. Periodically forces rollups that outlived the grace period
///
/// Runs until the shutdown phase leaves `Running` or every sample sender is
/// dropped. On exit, buffered samples are processed and `flush_all` is run.
pub async fn start_pipeline_ingestion(
    mut rx: mpsc::Receiver<Sample>,
    engine: Arc<AggregationEngine>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
    sweep_interval: Duration,
    mut shutdown: watch::Receiver<ShutdownPhase>,
) {
    log::info!("🚀 Starting pipeline ingestion");
    log::info!("   ├─ Window length: {}s", engine.settings().window_length_secs);
    log::info!("   ├─ Rollup sweep interval: {}ms", sweep_interval.as_millis());
    log::info!("   └─ Waiting for samples...");

    let mut sweep_timer = interval(sweep_interval);
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sample_count = 0u64;
    let mut last_log_time = std::time::Instant::now();

    loop {
        tokio::select! {
            maybe_sample = rx.recv() => {
                let Some(sample) = maybe_sample else {
                    log::warn!("⚠️  Sample channel closed, stopping ingestion");
                    break;
                };
                process_sample(&engine, sample, &persist_tx);
                sample_count += 1;

                // Log throughput every 10 seconds
                if last_log_time.elapsed().as_secs() >= 10 {
                    let per_sec = sample_count as f64 / last_log_time.elapsed().as_secs_f64();
                    let stats = engine.stats_snapshot();
                    log::info!(
                        "📊 Ingestion rate: {:.1} samples/sec | rejected: {} | pending windows: {} | channel: {}",
                        per_sec,
                        stats.samples_rejected(),
                        engine.pending_windows().len(),
                        rx.len()
                    );
                    last_log_time = std::time::Instant::now();
                    sample_count = 0;
                }
            }

            _ = sweep_timer.tick() => {
                match engine.sweep_expired() {
                    Ok(batches) => forward(&engine, batches, &persist_tx),
                    Err(e) => log::error!("❌ Rollup sweep failed: {}", e),
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() != ShutdownPhase::Running {
                    log::info!("🛑 Shutdown requested, stopping ingestion");
                    break;
                }
            }
        }
    }

    // Samples already buffered are still ingested
    rx.close();
    let mut buffered = 0usize;
    while let Ok(sample) = rx.try_recv() {
        process_sample(&engine, sample, &persist_tx);
        buffered += 1;
    }
    if buffered > 0 {
        log::info!("   ├─ Processed {} buffered samples", buffered);
    }

    log::info!("🔄 Performing final flush...");
    match engine.flush_all() {
        Ok(batches) => {
            log::info!("   └─ {} window(s) handed to persistence", batches.len());
            forward(&engine, batches, &persist_tx);
        }
        Err(e) => log::error!("❌ Final flush failed: {}", e),
    }

    log::info!("✅ Pipeline ingestion stopped");
}

fn process_sample(
    engine: &AggregationEngine,
    sample: Sample,
    persist_tx: &mpsc::UnboundedSender<PersistJob>,
) {
    match engine.ingest(sample) {
        Ok(batches) => forward(engine, batches, persist_tx),
        Err(e) if e.is_sample_local() => log::warn!("⚠️  Sample rejected: {}", e),
        Err(e) => log::error!("❌ Ingest failed: {}", e),
    }
}

/// Queue batches and any engine events for persistence
fn forward(
    engine: &AggregationEngine,
    batches: Vec<FlushBatch>,
    persist_tx: &mpsc::UnboundedSender<PersistJob>,
) {
    let jobs = batches
        .into_iter()
        .map(PersistJob::Batch)
        .chain(engine.take_events().into_iter().map(PersistJob::Event));

    for job in jobs {
        if let Err(mpsc::error::SendError(job)) = persist_tx.send(job) {
            log::error!("❌ Persistence worker gone, dropping {}", describe(&job));
        }
    }
}

fn describe(job: &PersistJob) -> String {
    match job {
        PersistJob::Batch(batch) => format!(
            "batch for window {} ({} source rows, system row: {})",
            batch.window_start,
            batch.sources.len(),
            batch.system.is_some()
        ),
        PersistJob::Event(event) => format!("{} event", event.event_type),
    }
}

async fn write_job(writer: &dyn AggregateDbWriter, job: &PersistJob) -> Result<(), StorageError> {
    match job {
        PersistJob::Batch(batch) => writer.write_flush_batch(batch).await,
        PersistJob::Event(event) => writer.record_event(event).await,
    }
}

/// Resolves once the phase reaches `TornDown`; never resolves if the
/// controlling handle was dropped
async fn wait_teardown(shutdown: &mut watch::Receiver<ShutdownPhase>) {
    loop {
        if *shutdown.borrow() == ShutdownPhase::TornDown {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Write queued jobs in order until the queue closes
///
/// A failed job stays at the head of the backlog and is retried with
/// exponential backoff; nothing is discarded before teardown.
pub async fn run_persistence_worker(
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
    writer: Arc<dyn AggregateDbWriter>,
    settings: PersistenceSettings,
    stats: Arc<EngineStats>,
    mut shutdown: watch::Receiver<ShutdownPhase>,
) -> PersistenceReport {
    let mut report = PersistenceReport::default();
    let mut backlog: VecDeque<PersistJob> = VecDeque::new();
    let mut backoff = ExponentialBackoff::new(settings.retry_initial_ms, settings.retry_max_ms);
    let mut input_open = true;

    'work: loop {
        if backlog.is_empty() {
            if !input_open {
                break;
            }
            match rx.recv().await {
                Some(job) => backlog.push_back(job),
                None => {
                    input_open = false;
                    continue;
                }
            }
        }

        let Some(job) = backlog.front() else {
            continue;
        };

        match write_job(writer.as_ref(), job).await {
            Ok(()) => {
                count_success(&mut report, &stats, job);
                backlog.pop_front();
                if backoff.attempts() > 0 {
                    log::info!(
                        "✅ Store recovered after {} failed attempt(s)",
                        backoff.attempts()
                    );
                }
                backoff.reset();
            }
            Err(e) => {
                EngineStats::incr(&stats.persistence_failures);
                let first_failure = backoff.attempts() == 0;

                if first_failure {
                    if let PersistJob::Batch(batch) = job {
                        let event = EngineEvent::persistence_failure(
                            chrono::Utc::now().timestamp_millis(),
                            batch.window_start,
                            1,
                            &e.to_string(),
                        );
                        backlog.push_back(PersistJob::Event(event));
                    }
                }

                if *shutdown.borrow() == ShutdownPhase::TornDown {
                    break 'work;
                }

                let delay = backoff.next_delay();
                log::error!(
                    "❌ Persistence failed ({}), {} job(s) held, retry {} in {}ms",
                    e,
                    backlog.len(),
                    backoff.attempts(),
                    delay.as_millis()
                );

                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = wait_teardown(&mut shutdown) => break 'work,
                }
            }
        }
    }

    // Teardown: collect whatever is still queued and make the last attempts
    rx.close();
    while let Ok(job) = rx.try_recv() {
        backlog.push_back(job);
    }
    if !backlog.is_empty() {
        log::warn!(
            "⚠️  Teardown with {} job(s) unwritten, making {} final attempt(s) each",
            backlog.len(),
            settings.final_flush_attempts
        );
    }

    for job in backlog {
        let mut last_error = None;
        for attempt in 1..=settings.final_flush_attempts.max(1) {
            match write_job(writer.as_ref(), &job).await {
                Ok(()) => {
                    last_error = None;
                    count_success(&mut report, &stats, &job);
                    break;
                }
                Err(e) => {
                    EngineStats::incr(&stats.persistence_failures);
                    log::debug!(
                        "   ├─ Final attempt {} for {} failed: {}",
                        attempt,
                        describe(&job),
                        e
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        if let Some(error) = last_error {
            log::error!("❌ Giving up on {}: {}", describe(&job), error);
            match job {
                PersistJob::Batch(batch) => report.failed_batches.push(FailedBatch {
                    window_start: batch.window_start,
                    source_rows: batch.sources.len(),
                    has_system_row: batch.system.is_some(),
                    error,
                }),
                PersistJob::Event(_) => report.failed_events += 1,
            }
        }
    }

    log::info!(
        "✅ Persistence worker stopped: {} batches, {} events written, {} batches failed",
        report.batches_persisted,
        report.events_persisted,
        report.failed_batches.len()
    );
    report
}

fn count_success(report: &mut PersistenceReport, stats: &EngineStats, job: &PersistJob) {
    match job {
        PersistJob::Batch(_) => {
            report.batches_persisted += 1;
            EngineStats::incr(&stats.batches_persisted);
        }
        PersistJob::Event(_) => report.events_persisted += 1,
    }
}

/// Running pipeline: the sample sender plus the two background tasks
pub struct PipelineHandle {
    sample_tx: mpsc::Sender<Sample>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
    engine: Arc<AggregationEngine>,
    shutdown_tx: watch::Sender<ShutdownPhase>,
    ingestion: JoinHandle<()>,
    persistence: JoinHandle<PersistenceReport>,
    drain_timeout: Duration,
}

/// Spawn the ingestion loop and persistence worker on the current runtime
pub fn spawn_pipeline(
    engine: Arc<AggregationEngine>,
    writer: Arc<dyn AggregateDbWriter>,
    options: PipelineOptions,
) -> PipelineHandle {
    let (sample_tx, sample_rx) = mpsc::channel(options.channel_buffer.max(1));
    let (persist_tx, persist_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownPhase::Running);

    let persistence = tokio::spawn(run_persistence_worker(
        persist_rx,
        writer,
        options.persistence,
        engine.stats(),
        shutdown_rx.clone(),
    ));

    let ingestion = tokio::spawn(start_pipeline_ingestion(
        sample_rx,
        Arc::clone(&engine),
        persist_tx.clone(),
        options.sweep_interval,
        shutdown_rx,
    ));

    PipelineHandle {
        sample_tx,
        persist_tx,
        engine,
        shutdown_tx,
        ingestion,
        persistence,
        drain_timeout: options.drain_timeout,
    }
}

impl PipelineHandle {
    /// Sender for feeding samples; clone freely
    pub fn sender(&self) -> mpsc::Sender<Sample> {
        self.sample_tx.clone()
    }

    pub fn engine(&self) -> Arc<AggregationEngine> {
        Arc::clone(&self.engine)
    }

    /// Deregister a source and persist any windows it was holding back
    pub fn deregister_source(&self, source_id: &str) -> Result<(), EngineError> {
        let batches = self.engine.deregister_source(source_id)?;
        forward(&self.engine, batches, &self.persist_tx);
        Ok(())
    }

    /// Stop ingestion, flush everything, and wait for persistence
    ///
    /// Retries run for at most the drain timeout before teardown. Use
    /// `PersistenceReport::into_result` to turn unwritten batches into a
    /// `PersistenceFailure`.
    pub async fn shutdown(self) -> Result<PersistenceReport, EngineError> {
        let PipelineHandle {
            sample_tx,
            persist_tx,
            engine: _,
            shutdown_tx,
            ingestion,
            mut persistence,
            drain_timeout,
        } = self;

        drop(sample_tx);
        let _ = shutdown_tx.send(ShutdownPhase::Draining);

        if let Err(e) = ingestion.await {
            log::error!("❌ Ingestion task failed: {}", e);
        }
        // Ingestion has dropped its sender; dropping ours closes the queue
        drop(persist_tx);

        let joined = match tokio::time::timeout(drain_timeout, &mut persistence).await {
            Ok(joined) => joined,
            Err(_) => {
                log::warn!(
                    "⏱️  Persistence still retrying after {}ms, tearing down",
                    drain_timeout.as_millis()
                );
                let _ = shutdown_tx.send(ShutdownPhase::TornDown);
                persistence.await
            }
        };

        joined.map_err(|e| EngineError::InvalidState(format!("persistence task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::engine::EngineSettings;
    use crate::pipeline::types::{SourceAggregate, SourceInfo, SystemAggregate};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory writer that fails the first `fail_first` writes
    #[derive(Default)]
    struct FlakyWriter {
        fail_first: usize,
        always_fail: bool,
        calls: AtomicUsize,
        batches: Mutex<Vec<FlushBatch>>,
        events: Mutex<Vec<EngineEvent>>,
    }

    impl FlakyWriter {
        fn check(&self) -> Result<(), StorageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.always_fail || call < self.fail_first {
                return Err(StorageError::Unavailable("store offline".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl AggregateDbWriter for FlakyWriter {
        async fn upsert_source_aggregate(
            &self,
            _aggregate: &SourceAggregate,
        ) -> Result<(), StorageError> {
            self.check()
        }

        async fn upsert_system_aggregate(
            &self,
            _aggregate: &SystemAggregate,
        ) -> Result<(), StorageError> {
            self.check()
        }

        async fn write_flush_batch(&self, batch: &FlushBatch) -> Result<(), StorageError> {
            self.check()?;
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }

        async fn record_event(&self, event: &EngineEvent) -> Result<(), StorageError> {
            self.check()?;
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn options(drain_timeout_ms: u64) -> PipelineOptions {
        PipelineOptions {
            channel_buffer: 64,
            sweep_interval: Duration::from_millis(20),
            drain_timeout: Duration::from_millis(drain_timeout_ms),
            persistence: PersistenceSettings {
                retry_initial_ms: 5,
                retry_max_ms: 20,
                final_flush_attempts: 2,
            },
        }
    }

    fn engine_with(ids: &[&str]) -> Arc<AggregationEngine> {
        let engine = Arc::new(AggregationEngine::new(EngineSettings::default()));
        for id in ids {
            engine.register_source(SourceInfo::new(*id, 100.0)).unwrap();
        }
        engine
    }

    fn sample(source_id: &str, ts_ms: i64, power: f64) -> Sample {
        Sample::new(source_id, ts_ms, 24.0, power / 24.0, power)
    }

    #[tokio::test]
    async fn test_shutdown_flushes_open_windows() {
        let engine = engine_with(&["A"]);
        let writer = Arc::new(FlakyWriter::default());
        let handle = spawn_pipeline(Arc::clone(&engine), writer.clone(), options(1_000));

        let tx = handle.sender();
        for i in 0..4 {
            tx.send(sample("A", 10_000 + i * 100, 10.0 + i as f64)).await.unwrap();
        }
        drop(tx);

        let report = handle.shutdown().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.batches_persisted, 1);

        let batches = writer.batches.lock().unwrap();
        assert_eq!(batches[0].sources[0].sample_count, 4);
        assert!(batches[0].system.is_some());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let engine = engine_with(&["A"]);
        let writer = Arc::new(FlakyWriter {
            fail_first: 3,
            ..Default::default()
        });
        let handle = spawn_pipeline(Arc::clone(&engine), writer.clone(), options(2_000));

        let tx = handle.sender();
        tx.send(sample("A", 10_000, 5.0)).await.unwrap();
        tx.send(sample("A", 11_000, 5.0)).await.unwrap();
        drop(tx);

        let report = handle.shutdown().await.unwrap().into_result().unwrap();
        assert_eq!(report.batches_persisted, 2);
        assert_eq!(writer.batches.lock().unwrap().len(), 2);
        // One PERSISTENCE_FAILURE event is written once the store recovers
        let events = writer.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EngineEvent::PERSISTENCE_FAILURE);
        assert!(engine.stats_snapshot().persistence_failures >= 3);
    }

    #[tokio::test]
    async fn test_teardown_reports_unwritten_batches() {
        let engine = engine_with(&["A"]);
        let writer = Arc::new(FlakyWriter {
            always_fail: true,
            ..Default::default()
        });
        let handle = spawn_pipeline(Arc::clone(&engine), writer, options(100));

        let tx = handle.sender();
        tx.send(sample("A", 10_000, 5.0)).await.unwrap();
        drop(tx);

        let report = handle.shutdown().await.unwrap();
        assert_eq!(report.batches_persisted, 0);
        assert_eq!(report.failed_batches.len(), 1);
        assert_eq!(report.failed_batches[0].window_start, 10);
        assert!(report.failed_batches[0].has_system_row);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, EngineError::PersistenceFailure { failed_batches: 1, .. }));
    }

    #[tokio::test]
    async fn test_rejected_samples_do_not_stop_ingestion() {
        let engine = engine_with(&["A"]);
        let writer = Arc::new(FlakyWriter::default());
        let handle = spawn_pipeline(Arc::clone(&engine), writer.clone(), options(1_000));

        let tx = handle.sender();
        tx.send(sample("ghost", 10_000, 5.0)).await.unwrap();
        tx.send(sample("A", 10_000, f64::INFINITY)).await.unwrap();
        tx.send(sample("A", 10_100, 5.0)).await.unwrap();
        drop(tx);

        let report = handle.shutdown().await.unwrap();
        assert_eq!(report.batches_persisted, 1);
        let stats = engine.stats_snapshot();
        assert_eq!(stats.samples_rejected(), 2);
        assert_eq!(stats.samples_ingested, 1);
    }

    #[tokio::test]
    async fn test_sweep_forces_rollup_while_running() {
        let engine = Arc::new(AggregationEngine::new(EngineSettings {
            grace_period_ms: 0,
            ..EngineSettings::default()
        }));
        engine.register_source(SourceInfo::new("A", 100.0)).unwrap();
        engine.register_source(SourceInfo::new("B", 100.0)).unwrap();
        let writer = Arc::new(FlakyWriter::default());
        let handle = spawn_pipeline(Arc::clone(&engine), writer.clone(), options(1_000));

        let tx = handle.sender();
        tx.send(sample("A", 10_000, 5.0)).await.unwrap();
        tx.send(sample("A", 11_000, 5.0)).await.unwrap();

        // Give the sweep timer a few ticks
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.stats_snapshot().rollups_timed_out, 1);

        drop(tx);
        handle.shutdown().await.unwrap();
        let events = writer.events.lock().unwrap();
        assert!(events.iter().any(|e| e.event_type == EngineEvent::ROLLUP_TIMEOUT));
    }
}
