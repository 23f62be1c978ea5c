// Match loop: visits with candidates -> match identities

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_durable::persistence::WatermarkAdvance;
use beacon_durable::{retry_transient, PipelineStore, RetryPolicy};
use beacon_schemas::{SequenceRange, EXTRACT_PROCESS, MATCH_PROCESS};
use chrono::Utc;
use tracing::{debug, instrument, Instrument};

use super::{attempt_span, BatchOutcome, BatchProcessor};
use crate::error::PipelineError;
use crate::pipeline::resolver::{merge_batch, IdentityResolver};

pub struct MatchProcessor {
    store: Arc<dyn PipelineStore>,
    resolver: IdentityResolver,
    retry: RetryPolicy,
    lookback: Duration,
}

impl MatchProcessor {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        resolver: IdentityResolver,
        retry: RetryPolicy,
        lookback: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            retry,
            lookback,
        }
    }
}

#[async_trait]
impl BatchProcessor for MatchProcessor {
    fn process_name(&self) -> &'static str {
        MATCH_PROCESS
    }

    /// Visits exist only up to the extract watermark; with a lookback the
    /// most recent window is held back as well.
    async fn max_available_id(&self) -> Result<i64, PipelineError> {
        let extracted = self
            .store
            .load_watermark(EXTRACT_PROCESS)
            .await?
            .last_processed_id;
        if self.lookback.is_zero() {
            return Ok(extracted);
        }

        let lookback = chrono::Duration::from_std(self.lookback).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(lookback)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let settled = self.store.max_visit_id_received_before(cutoff).await?;
        Ok(extracted.min(settled))
    }

    #[instrument(skip(self), fields(range = %range))]
    async fn process(&self, range: SequenceRange) -> Result<BatchOutcome, PipelineError> {
        let visits = self.store.load_match_candidates(range).await?;
        let batch = self.resolver.resolve_batch(&visits).await?;
        debug!(
            candidates = visits.len(),
            rejected = batch.rejected,
            lookups = batch.lookups,
            "candidates resolved"
        );

        let rows_processed = visits.len() as i64;
        let store = &self.store;
        let resolved = &batch.resolved;

        let (rows_matched, watermark) =
            retry_transient(&self.retry, MATCH_PROCESS, move |attempt| {
                async move {
                    debug!("writing match batch");
                    let now = Utc::now();
                    let mut tx = store.begin().await?;
                    let matched = merge_batch(tx.as_mut(), resolved, now).await?;
                    let watermark = tx
                        .advance_watermark(&WatermarkAdvance {
                            process_name: MATCH_PROCESS.to_string(),
                            to: range.end,
                            rows_processed,
                            rows_matched: matched,
                            at: now,
                        })
                        .await?;
                    tx.commit().await?;
                    Ok::<_, PipelineError>((matched, watermark))
                }
                .instrument(attempt_span(MATCH_PROCESS, attempt))
            })
            .await?;

        Ok(BatchOutcome {
            range,
            rows_processed,
            rows_matched,
            rows_written: resolved.len() as i64,
            watermark,
        })
    }
}
