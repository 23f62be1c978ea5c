use std::sync::Arc;

use anyhow::{Context, Result};
use beacon_core::telemetry::{init_telemetry, TelemetryConfig};
use beacon_durable::{PostgresPipelineStore, PostgresReferenceDataset};
use beacon_worker::{PipelineConfig, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - OTEL_SERVICE_NAME: Service name (default: "beacon-worker")
    // - OTEL_EXPORTER_OTLP_ENDPOINT: OTLP endpoint (e.g., "http://localhost:4317")
    // - RUST_LOG or LOG_LEVEL: Log filter (LOG_LEVEL defaults to "info")
    let telemetry_config = TelemetryConfig::from_env_with_defaults(
        "beacon-worker",
        &["beacon_worker", "beacon_durable"],
    );
    let _telemetry_guard = init_telemetry(telemetry_config);

    let config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    tracing::info!(
        extract_interval_secs = config.extract.interval.as_secs(),
        extract_batch_size = config.extract.batch_size,
        match_interval_secs = config.matching.interval.as_secs(),
        match_batch_size = config.matching.batch_size,
        match_lookback_secs = config.match_lookback.as_secs(),
        "beacon-worker starting"
    );

    let store = PostgresPipelineStore::connect(
        &config.database.url,
        config.database.max_connections,
    )
    .await
    .context("Failed to connect to pipeline store")?;
    if config.database.run_migrations {
        store.migrate().await.context("Failed to run migrations")?;
        tracing::info!("Migrations applied");
    }

    let reference = PostgresReferenceDataset::connect_lazy(
        &config.database.reference_url,
        config.database.max_connections,
    )
    .context("Invalid reference database URL")?;

    let scheduler = Scheduler::new(&config, Arc::new(store), Arc::new(reference));

    let run = scheduler.run();
    tokio::pin!(run);
    tokio::select! {
        _ = &mut run => {
            tracing::warn!("Loops exited without shutdown signal");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, finishing in-flight batches");
            scheduler.shutdown();
            run.await;
        }
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
