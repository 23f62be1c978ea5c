// Pipeline scheduler
//
// Two independent periodic loops, extract and match. Each tick reads the
// loop's watermark, processes at most one batch and sleeps for the loop's
// interval. Shutdown is observed between ticks, so a batch in flight always
// runs to completion.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::telemetry::{attrs, tick_span_name};
use beacon_durable::{PipelineStore, ReferenceDataset};
use beacon_schemas::{SequenceRange, Watermark};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, field, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{LoopConfig, PipelineConfig};
use crate::error::PipelineError;
use crate::pipeline::resolver::IdentityResolver;
use crate::processor::{BatchProcessor, ExtractProcessor, MatchProcessor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Running,
}

/// Outcome of one tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    /// `None` when the loop was already caught up
    pub range: Option<SequenceRange>,
    pub rows_processed: i64,
    pub rows_matched: i64,
    pub watermark: i64,
    /// Max available id minus watermark after the tick
    pub lag: i64,
    pub finished_at: DateTime<Utc>,
}

/// Snapshot of a loop for operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopStatus {
    pub process_name: &'static str,
    pub state: LoopState,
    pub last_tick: Option<TickReport>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// One periodic loop around a batch processor
pub struct PipelineLoop {
    processor: Arc<dyn BatchProcessor>,
    store: Arc<dyn PipelineStore>,
    settings: LoopConfig,
    status: RwLock<LoopStatus>,
}

impl PipelineLoop {
    pub fn new(
        processor: Arc<dyn BatchProcessor>,
        store: Arc<dyn PipelineStore>,
        settings: LoopConfig,
    ) -> Self {
        let status = LoopStatus {
            process_name: processor.process_name(),
            state: LoopState::Idle,
            last_tick: None,
            last_error: None,
            consecutive_failures: 0,
        };
        Self {
            processor,
            store,
            settings,
            status: RwLock::new(status),
        }
    }

    pub fn process_name(&self) -> &'static str {
        self.processor.process_name()
    }

    pub fn status(&self) -> LoopStatus {
        self.status.read().clone()
    }

    /// Run a single tick: at most one batch
    pub async fn tick(&self) -> Result<TickReport, PipelineError> {
        let process = self.process_name();
        let span = info_span!(
            "tick",
            otel.name = %tick_span_name(process),
            tick_id = %Uuid::now_v7(),
            "pipeline.process" = field::Empty,
            "pipeline.range.start" = field::Empty,
            "pipeline.range.end" = field::Empty,
            "pipeline.rows.processed" = field::Empty,
            "pipeline.rows.matched" = field::Empty,
            "pipeline.watermark" = field::Empty,
            "pipeline.lag" = field::Empty,
        );
        span.record(attrs::PROCESS, process);

        self.status.write().state = LoopState::Running;
        let result = self.run_batch().instrument(span.clone()).await;

        let mut status = self.status.write();
        status.state = LoopState::Idle;
        match &result {
            Ok(report) => {
                if let Some(range) = report.range {
                    span.record(attrs::RANGE_START, range.start);
                    span.record(attrs::RANGE_END, range.end);
                }
                span.record(attrs::ROWS_PROCESSED, report.rows_processed);
                span.record(attrs::ROWS_MATCHED, report.rows_matched);
                span.record(attrs::WATERMARK, report.watermark);
                span.record(attrs::LAG, report.lag);
                status.last_tick = Some(report.clone());
                status.last_error = None;
                status.consecutive_failures = 0;
            }
            Err(e) => {
                status.last_error = Some(e.to_string());
                status.consecutive_failures += 1;
            }
        }
        result
    }

    async fn run_batch(&self) -> Result<TickReport, PipelineError> {
        let watermark = self.store.load_watermark(self.process_name()).await?;
        let max_available = self.processor.max_available_id().await?;

        let Some(range) = watermark.next_range(self.settings.batch_size, max_available) else {
            return Ok(idle_report(&watermark, max_available));
        };

        let outcome = self.processor.process(range).await?;
        Ok(TickReport {
            range: Some(range),
            rows_processed: outcome.rows_processed,
            rows_matched: outcome.rows_matched,
            watermark: outcome.watermark.last_processed_id,
            lag: outcome.watermark.lag(max_available),
            finished_at: Utc::now(),
        })
    }

    /// Tick until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let process = self.process_name();
        info!(
            process,
            interval_secs = self.settings.interval.as_secs(),
            batch_size = self.settings.batch_size,
            "loop starting"
        );

        let stagger = self.settings.stagger;
        if !stagger.is_zero() && wait_or_shutdown(&mut shutdown, stagger).await {
            info!(process, "loop stopped");
            return;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(report) => info!(
                    process,
                    processed = report.rows_processed,
                    matched = report.rows_matched,
                    watermark = report.watermark,
                    lag = report.lag,
                    "tick complete"
                ),
                Err(e) => {
                    let failures = self.status.read().consecutive_failures;
                    if failures > 1 {
                        error!(process, error = %e, failures, "tick failed again");
                    } else {
                        error!(process, error = %e, "tick failed");
                    }
                }
            }

            if wait_or_shutdown(&mut shutdown, self.settings.interval).await {
                break;
            }
        }

        info!(process, "loop stopped");
    }
}

fn idle_report(watermark: &Watermark, max_available: i64) -> TickReport {
    TickReport {
        range: None,
        rows_processed: 0,
        rows_matched: 0,
        watermark: watermark.last_processed_id,
        lag: watermark.lag(max_available),
        finished_at: Utc::now(),
    }
}

/// Sleep for `delay`; returns true if shutdown arrived first
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    match tokio::time::timeout(delay, shutdown.changed()).await {
        Err(_elapsed) => false,
        // sender gone counts as shutdown
        Ok(changed) => changed.is_err() || *shutdown.borrow(),
    }
}

/// Owns both pipeline loops
pub struct Scheduler {
    extract: Arc<PipelineLoop>,
    matching: Arc<PipelineLoop>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        config: &PipelineConfig,
        store: Arc<dyn PipelineStore>,
        reference: Arc<dyn ReferenceDataset>,
    ) -> Self {
        let extract = ExtractProcessor::new(
            store.clone(),
            beacon_core::Extractor::new(config.extractor.clone()),
            config.retry.clone(),
        );
        let matching = MatchProcessor::new(
            store.clone(),
            IdentityResolver::new(reference),
            config.retry.clone(),
            config.match_lookback,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            extract: Arc::new(PipelineLoop::new(
                Arc::new(extract),
                store.clone(),
                config.extract.clone(),
            )),
            matching: Arc::new(PipelineLoop::new(
                Arc::new(matching),
                store,
                config.matching.clone(),
            )),
            shutdown_tx,
        }
    }

    pub fn extract_loop(&self) -> &Arc<PipelineLoop> {
        &self.extract
    }

    pub fn match_loop(&self) -> &Arc<PipelineLoop> {
        &self.matching
    }

    /// Run both loops until shutdown
    pub async fn run(&self) {
        let extract = tokio::spawn(self.extract.clone().run(self.shutdown_tx.subscribe()));
        let matching = tokio::spawn(self.matching.clone().run(self.shutdown_tx.subscribe()));

        let (extract, matching) = tokio::join!(extract, matching);
        for (process, joined) in [("extract", extract), ("match", matching)] {
            if let Err(e) = joined {
                warn!(process, error = %e, "loop task ended abnormally");
            }
        }
    }

    /// Ask both loops to stop at their next batch boundary
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn statuses(&self) -> Vec<LoopStatus> {
        vec![self.extract.status(), self.matching.status()]
    }
}

#[cfg(test)]
mod tests {
    use beacon_durable::{InMemoryPipelineStore, InMemoryReferenceDataset};
    use beacon_schemas::EXTRACT_PROCESS;

    use super::*;

    fn scheduler(store: &InMemoryPipelineStore) -> Scheduler {
        let mut config = PipelineConfig::default();
        config.extract.interval = Duration::from_secs(1);
        config.matching.stagger = Duration::ZERO;
        Scheduler::new(
            &config,
            Arc::new(store.clone()),
            Arc::new(InMemoryReferenceDataset::new()),
        )
    }

    #[tokio::test]
    async fn test_tick_short_circuits_when_caught_up() {
        let store = InMemoryPipelineStore::new();
        let scheduler = scheduler(&store);

        let report = scheduler.extract_loop().tick().await.unwrap();
        assert_eq!(report.range, None);
        assert_eq!(report.rows_processed, 0);
        assert_eq!(report.lag, 0);
        assert_eq!(scheduler.extract_loop().status().state, LoopState::Idle);
    }

    #[tokio::test]
    async fn test_tick_records_status() {
        let store = InMemoryPipelineStore::new();
        store
            .append_raw_event("t", "c", "203.0.113.9", "canvas_hash=a", Utc::now())
            .await;
        let scheduler = scheduler(&store);

        let report = scheduler.extract_loop().tick().await.unwrap();
        assert_eq!(report.range, Some(SequenceRange { start: 1, end: 1 }));
        assert_eq!(report.watermark, 1);

        let status = scheduler.extract_loop().status();
        assert_eq!(status.process_name, EXTRACT_PROCESS);
        assert_eq!(status.last_tick, Some(report));
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_both_loops() {
        let store = InMemoryPipelineStore::new();
        let scheduler = Arc::new(scheduler(&store));

        let running = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run().await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        scheduler.shutdown();

        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert!(scheduler
            .statuses()
            .iter()
            .all(|s| s.state == LoopState::Idle));
    }
}
