//! Panelflow Runtime - telemetry ingestion to SQLite
//!
//! Reads JSON-lines samples from stdin, aggregates them into fixed windows
//! and persists per-source and system aggregates.
//!
//! Usage:
//!   sensor-feed | cargo run --release --bin panelflow_runtime
//!
//! One sample per line:
//!   {"source_id":"PS100_01","timestamp_ms":1700000000123,"voltage":26.1,"current":3.2,"power":83.5,
//!    "temperature":41.0,"alert_flags":["power_over_limit"],"conditions":"Full Sun"}
//!
//! Environment variables (see `PipelineConfig::from_env` for the full list):
//!   PANELFLOW_DB_PATH - SQLite database path (default: data/panelflow.db)
//!   PANELFLOW_SOURCES - Registered sources, `id[:rated_w]` comma list
//!   WINDOW_LENGTH_SECS - Base window length (default: 1)
//!   RUST_LOG - Log filter (default: info)

use dotenv::dotenv;
use log::{error, info, warn};
use panelflow::pipeline::{
    config::PipelineConfig,
    db::{AggregateDbWriter, SqliteAggregateStore},
    engine::AggregationEngine,
    ingestion::{spawn_pipeline, PipelineOptions},
    types::Sample,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Panelflow Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env()?;

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Window length: {}s", config.window_length_secs);
    info!("   ├─ Channel buffer: {} samples", config.channel_buffer);
    info!("   ├─ Rollup grace period: {}ms", config.rollup_grace_period_ms);
    info!("   └─ Registered sources: {}", config.sources.len());

    if config.sources.is_empty() {
        warn!("⚠️  PANELFLOW_SOURCES is empty, every sample will be rejected as unknown");
    }

    // Initialize database (pragmas, migrations, storage policies)
    info!("🔧 Initializing database...");
    let store = SqliteAggregateStore::open(
        &config.db_path,
        &config.schema_dir,
        config.compression_after_days,
    )?;
    let db_writer: Arc<dyn AggregateDbWriter> = Arc::new(store);
    info!("✅ Database initialized");

    let engine = Arc::new(AggregationEngine::new(config.engine_settings()));
    for source in &config.sources {
        engine.register_source(source.clone())?;
    }
    info!("✅ AggregationEngine created");

    let handle = spawn_pipeline(Arc::clone(&engine), db_writer, PipelineOptions::from(&config));
    info!("✅ Ingestion and persistence tasks spawned");

    let reader = tokio::spawn(read_samples(handle.sender()));
    info!("🔄 Reading samples from stdin (CTRL+C to stop)");

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
            Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
        },
        _ = reader => info!("📭 Input closed, shutting down..."),
    }

    let report = handle.shutdown().await?;
    let stats = engine.stats_snapshot();
    info!("📊 Final statistics:");
    info!("   ├─ Samples ingested: {}", stats.samples_ingested);
    info!("   ├─ Samples rejected: {}", stats.samples_rejected());
    info!("   ├─ Windows closed: {}", stats.windows_closed);
    info!(
        "   ├─ Rollups: {} complete, {} timed out, {} drained",
        stats.rollups_complete, stats.rollups_timed_out, stats.rollups_drained
    );
    info!("   └─ Batches persisted: {}", report.batches_persisted);

    match report.into_result() {
        Ok(_) => {
            info!("✅ Panelflow runtime stopped");
            Ok(())
        }
        Err(e) => {
            error!("❌ {}", e);
            Err(e.into())
        }
    }
}

/// Forward stdin JSON lines to the pipeline until EOF
async fn read_samples(tx: mpsc::Sender<Sample>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("❌ Failed to read stdin: {}", e);
                break;
            }
        };
        line_no += 1;

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Sample>(&line) {
            Ok(sample) => {
                if tx.send(sample).await.is_err() {
                    warn!("⚠️  Pipeline stopped accepting samples");
                    break;
                }
            }
            Err(e) => warn!("⚠️  Skipping line {}: {}", line_no, e),
        }
    }
}
